//! Procedural memory: learned trigger → steps associations.
//!
//! Procedures follow a reinforcement model:
//! - Candidates are extracted from user → assistant exchanges.
//! - Each re-observation adds 1.0 to the candidate's weight after decaying
//!   the stored weight with a 30-day half-life.
//! - Weight ≥ [`USABLE_THRESHOLD`] → `usable` (eligible for prompt context).
//! - Weight ≥ [`PERMANENT_THRESHOLD`] → `permanent` (never decays, written to
//!   the markdown store).

pub mod candidates;
pub mod codec;
pub mod extract;
pub mod matching;
pub mod store;

pub use candidates::CandidateStore;
pub use codec::{is_empty_procedure_document, parse_markdown, to_markdown};
pub use extract::extract_candidates;
pub use matching::{match_query, merge_procedures, sequence_ratio};
pub use store::ProcedureStore;

use std::sync::LazyLock;

use chrono::{Local, NaiveDate};
use lobster_core::text::normalize;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Decay half-life in days.
pub const DECAY_HALF_LIFE_DAYS: f64 = 30.0;
/// Effective weight at which a candidate becomes usable.
pub const USABLE_THRESHOLD: f64 = 3.0;
/// Weight at which a candidate becomes permanent.
pub const PERMANENT_THRESHOLD: f64 = 10.0;

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("token pattern compiles"));

/// Promotion status of a procedure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureStatus {
    /// Observed, not yet trusted.
    #[default]
    Candidate,
    /// Trusted enough to surface in context.
    Usable,
    /// Promoted; never decays.
    Permanent,
}

impl ProcedureStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Usable => "usable",
            Self::Permanent => "permanent",
        }
    }

    /// Parse a status name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "candidate" => Some(Self::Candidate),
            "usable" => Some(Self::Usable),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }

    /// Status implied by a raw weight.
    pub fn for_weight(weight: f64, usable: f64, permanent: f64) -> Self {
        if weight >= permanent {
            Self::Permanent
        } else if weight >= usable {
            Self::Usable
        } else {
            Self::Candidate
        }
    }
}

/// A learned procedure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    /// Human-readable title.
    pub title: String,
    /// Phrase that activates the procedure.
    pub trigger: String,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Raw (undecayed) weight.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Promotion status.
    #[serde(default)]
    pub status: ProcedureStatus,
    /// First observation date.
    #[serde(default = "today")]
    pub first_seen: NaiveDate,
    /// Most recent observation date.
    #[serde(default = "today")]
    pub last_seen: NaiveDate,
}

fn default_weight() -> f64 {
    1.0
}

/// Local calendar date.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl Procedure {
    /// A fresh candidate observed today.
    pub fn candidate(trigger: &str, steps: Vec<String>) -> Self {
        let now = today();
        Self {
            title: title_from_trigger(trigger),
            trigger: trigger.to_string(),
            steps,
            weight: 1.0,
            status: ProcedureStatus::Candidate,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Identity key: the normalised trigger.
    pub fn key(&self) -> String {
        normalize(&self.trigger)
    }

    /// Weight after decay as of `on`.
    pub fn effective_weight_at(&self, on: NaiveDate) -> f64 {
        effective_weight(self.weight, self.status, self.last_seen, on)
    }

    /// Weight after decay as of today.
    pub fn effective_weight(&self) -> f64 {
        self.effective_weight_at(today())
    }
}

/// Decayed weight: `raw × 2^(−days / 30)` for non-permanent procedures.
///
/// Permanent procedures and observations dated today or later are returned
/// unchanged.
pub fn effective_weight(raw: f64, status: ProcedureStatus, last_seen: NaiveDate, now: NaiveDate) -> f64 {
    if status == ProcedureStatus::Permanent {
        return raw;
    }
    let days = (now - last_seen).num_days();
    if days <= 0 {
        return raw;
    }
    #[allow(clippy::cast_precision_loss)]
    let exponent = -(days as f64) / DECAY_HALF_LIFE_DAYS;
    raw * exponent.exp2()
}

/// Lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_PATTERN
        .find_iter(&normalize(text))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Title-case the first six words of a trigger.
pub fn title_from_trigger(trigger: &str) -> String {
    let normalized = normalize(trigger);
    let words: Vec<String> = normalized
        .split(' ')
        .filter(|w| !w.is_empty())
        .take(6)
        .map(capitalize)
        .collect();
    if words.is_empty() {
        "Learned Procedure".to_string()
    } else {
        words.join(" ")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
