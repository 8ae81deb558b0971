//! Weighted, decaying ledger of every observed procedure candidate.
//!
//! Stored as `CANDIDATES.json`: an object keyed by normalised trigger.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use lobster_core::fs::atomic_write;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{PERMANENT_THRESHOLD, Procedure, ProcedureStatus, USABLE_THRESHOLD, effective_weight, today};
use crate::errors::Result;

/// JSON-backed candidate ledger.
pub struct CandidateStore {
    path: PathBuf,
    usable_threshold: f64,
    permanent_threshold: f64,
    lock: Mutex<()>,
}

impl CandidateStore {
    /// Open a ledger with the default promotion thresholds.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_thresholds(path, USABLE_THRESHOLD, PERMANENT_THRESHOLD)
    }

    /// Open a ledger with explicit thresholds.
    pub fn with_thresholds(path: impl Into<PathBuf>, usable: f64, permanent: f64) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            atomic_write(&path, b"{}\n")?;
        }
        Ok(Self {
            path,
            usable_threshold: usable,
            permanent_threshold: permanent.max(usable),
            lock: Mutex::new(()),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, Procedure> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "candidate ledger unreadable; starting empty");
                }
                return BTreeMap::new();
            }
        };
        let Ok(Value::Object(entries)) = serde_json::from_str::<Value>(&text) else {
            warn!(path = %self.path.display(), "candidate ledger is not a JSON object; starting empty");
            return BTreeMap::new();
        };
        entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value::<Procedure>(value) {
                Ok(p) => Some((key, p)),
                Err(e) => {
                    warn!(key, error = %e, "skipping malformed candidate");
                    None
                }
            })
            .collect()
    }

    fn persist(&self, entries: &BTreeMap<String, Procedure>) -> Result<()> {
        let mut text = serde_json::to_string_pretty(entries)?;
        text.push('\n');
        atomic_write(&self.path, text.as_bytes())?;
        Ok(())
    }

    /// Record observations dated today. See [`Self::ingest_at`].
    pub fn ingest(&self, candidates: &[Procedure]) -> Result<Vec<Procedure>> {
        self.ingest_at(candidates, today())
    }

    /// Record observations as of `on`.
    ///
    /// A new key starts at weight 1.0. A known key has its stored weight
    /// decayed to `on` (unless permanent) before 1.0 is added. Returns the
    /// entries that became permanent during this call.
    pub fn ingest_at(&self, candidates: &[Procedure], on: NaiveDate) -> Result<Vec<Procedure>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock();
        let mut entries = self.load();
        let mut promoted = Vec::new();

        for candidate in candidates {
            let key = candidate.key();
            if key.is_empty() || candidate.steps.is_empty() {
                continue;
            }
            let was_permanent = entries
                .get(&key)
                .is_some_and(|p| p.status == ProcedureStatus::Permanent);

            let entry = match entries.entry(key) {
                Entry::Occupied(slot) => {
                    let existing = slot.into_mut();
                    let base = effective_weight(existing.weight, existing.status, existing.last_seen, on);
                    existing.weight = round2(base + 1.0);
                    if candidate.steps.len() > existing.steps.len() {
                        existing.steps.clone_from(&candidate.steps);
                    }
                    existing.last_seen = on;
                    existing
                }
                Entry::Vacant(slot) => {
                    let mut fresh = candidate.clone();
                    fresh.weight = 1.0;
                    fresh.first_seen = on;
                    fresh.last_seen = on;
                    slot.insert(fresh)
                }
            };
            entry.status = if was_permanent {
                ProcedureStatus::Permanent
            } else {
                ProcedureStatus::for_weight(entry.weight, self.usable_threshold, self.permanent_threshold)
            };
            if !was_permanent && entry.status == ProcedureStatus::Permanent {
                info!(trigger = %entry.trigger, weight = entry.weight, "procedure promoted to permanent");
                promoted.push(entry.clone());
            }
        }

        self.persist(&entries)?;
        debug!(ingested = candidates.len(), promoted = promoted.len(), "candidates ingested");
        Ok(promoted)
    }

    /// Every stored candidate, ordered by key.
    pub fn list_all(&self) -> Vec<Procedure> {
        self.load().into_values().collect()
    }

    /// Candidates whose decayed weight as of `on` clears the usable bar.
    pub fn list_usable_at(&self, on: NaiveDate) -> Vec<Procedure> {
        self.load()
            .into_values()
            .filter(|p| p.effective_weight_at(on) >= self.usable_threshold)
            .collect()
    }

    /// Candidates usable today.
    pub fn list_usable(&self) -> Vec<Procedure> {
        self.list_usable_at(today())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
