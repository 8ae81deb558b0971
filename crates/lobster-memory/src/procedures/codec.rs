//! Markdown codec for `PROCEDURES.md`.
//!
//! ```text
//! # PROCEDURES
//!
//! ## Deploy App Production
//! Trigger: deploy app production
//! Weight: 10.0
//! Status: permanent
//! First seen: 2026-01-02
//! Last seen: 2026-02-03
//!
//! Steps:
//! 1. Check git status
//! 2. Run tests
//! ```
//!
//! Parsing is lenient: unknown lines are ignored, a legacy `Frequency:` line
//! stands in for a missing weight, status defaults to `permanent`, and the
//! trigger defaults to the section title.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use super::{Procedure, ProcedureStatus, title_from_trigger, today};
use crate::errors::{MemoryError, Result};

/// Header line of an empty document.
pub const DOCUMENT_HEADER: &str = "# PROCEDURES";

/// Message returned when a document fails validation.
pub const INVALID_DOCUMENT_MESSAGE: &str =
    "Invalid procedures format. Provide markdown sections with Trigger and Steps.";

static STEP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[.):]|[-*])\s+(.+?)\s*$").expect("step pattern compiles")
});

/// Text of a numbered (`1.`, `2)`, `3:`) or bulleted (`-`, `*`) line.
pub(crate) fn parse_step_line(line: &str) -> Option<&str> {
    STEP_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

/// True when the document holds nothing beyond the optional header.
pub fn is_empty_procedure_document(content: &str) -> bool {
    let significant: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    match significant.as_slice() {
        [] => true,
        [only] => only.eq_ignore_ascii_case(DOCUMENT_HEADER),
        _ => false,
    }
}

/// Parse a user-supplied document, rejecting anything that is neither a
/// valid procedure list nor effectively empty.
pub fn validate_document(content: &str) -> Result<Vec<Procedure>> {
    let procedures = parse_markdown(content);
    if procedures.is_empty() && !is_empty_procedure_document(content) {
        return Err(MemoryError::Validation(INVALID_DOCUMENT_MESSAGE.to_string()));
    }
    Ok(procedures)
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let head = line.get(..name.len())?;
    if head.eq_ignore_ascii_case(name) {
        line.get(name.len()..).map(str::trim)
    } else {
        None
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

#[derive(Default)]
struct SectionFields {
    trigger: String,
    weight: f64,
    frequency: u32,
    status: Option<ProcedureStatus>,
    first_seen: Option<NaiveDate>,
    last_seen: Option<NaiveDate>,
    steps: Vec<String>,
}

/// Parse every `## ` section of a document.
pub fn parse_markdown(content: &str) -> Vec<Procedure> {
    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    for line in content.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            sections.push((title.trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(line);
        }
    }

    sections
        .into_iter()
        .filter(|(title, _)| !title.is_empty())
        .map(|(title, body)| build_procedure(title, &body))
        .collect()
}

fn build_procedure(title: String, body: &[&str]) -> Procedure {
    let mut fields = SectionFields {
        frequency: 1,
        ..SectionFields::default()
    };
    let mut in_steps = false;

    for raw in body {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(v) = field(line, "trigger:") {
            fields.trigger = v.to_string();
        } else if let Some(v) = field(line, "weight:") {
            fields.weight = v.parse::<f64>().map_or(1.0, |w| w.max(0.0));
        } else if let Some(v) = field(line, "frequency:") {
            fields.frequency = v.parse::<u32>().map_or(1, |f| f.max(1));
        } else if let Some(v) = field(line, "status:") {
            fields.status = Some(ProcedureStatus::parse(v).unwrap_or(ProcedureStatus::Permanent));
        } else if let Some(v) = field(line, "last seen:") {
            fields.last_seen = parse_date(v);
        } else if let Some(v) = field(line, "first seen:") {
            fields.first_seen = parse_date(v);
        } else if field(line, "steps:").is_some() {
            in_steps = true;
            continue;
        } else {
            if in_steps {
                if let Some(step) = parse_step_line(line) {
                    fields.steps.push(step.to_string());
                }
            }
            continue;
        }
        in_steps = false;
    }

    // Legacy documents carry a frequency but no weight.
    if fields.weight == 0.0 {
        fields.weight = f64::from(fields.frequency);
    }
    let last_seen = fields.last_seen.unwrap_or_else(today);
    let trigger = if fields.trigger.is_empty() {
        title.clone()
    } else {
        fields.trigger
    };
    let title = if title.is_empty() {
        title_from_trigger(&trigger)
    } else {
        title
    };

    Procedure {
        title,
        trigger,
        steps: fields.steps,
        weight: fields.weight,
        status: fields.status.unwrap_or(ProcedureStatus::Permanent),
        first_seen: fields.first_seen.unwrap_or(last_seen),
        last_seen,
    }
}

/// Serialize procedures, dropping any without a trigger or steps.
///
/// Output is ordered by (title, trigger), case-insensitively.
pub fn to_markdown(procedures: &[Procedure]) -> String {
    let mut items: Vec<&Procedure> = procedures
        .iter()
        .filter(|p| !p.trigger.trim().is_empty() && !p.steps.is_empty())
        .collect();
    items.sort_by_cached_key(|p| (p.title.to_lowercase(), p.trigger.to_lowercase()));

    let mut lines: Vec<String> = vec![DOCUMENT_HEADER.to_string(), String::new()];
    for p in items {
        lines.push(format!("## {}", p.title));
        lines.push(format!("Trigger: {}", p.trigger));
        lines.push(format!("Weight: {:.1}", p.weight));
        lines.push(format!("Status: {}", p.status.as_str()));
        lines.push(format!("First seen: {}", p.first_seen.format("%Y-%m-%d")));
        lines.push(format!("Last seen: {}", p.last_seen.format("%Y-%m-%d")));
        lines.push(String::new());
        lines.push("Steps:".to_string());
        for (index, step) in p.steps.iter().enumerate() {
            lines.push(format!("{}. {step}", index + 1));
        }
        lines.push(String::new());
    }
    format!("{}\n", lines.join("\n").trim_end())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn sample() -> Procedure {
        Procedure {
            title: "Deploy App Production".into(),
            trigger: "deploy app production".into(),
            steps: vec!["Check git status".into(), "Run tests".into(), "Push image".into()],
            weight: 10.0,
            status: ProcedureStatus::Permanent,
            first_seen: date("2026-01-02"),
            last_seen: date("2026-02-03"),
        }
    }

    #[test]
    fn serializes_expected_layout() {
        let md = to_markdown(&[sample()]);
        let expected = "# PROCEDURES\n\n## Deploy App Production\nTrigger: deploy app production\n\
Weight: 10.0\nStatus: permanent\nFirst seen: 2026-01-02\nLast seen: 2026-02-03\n\n\
Steps:\n1. Check git status\n2. Run tests\n3. Push image\n";
        assert_eq!(md, expected);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut other = sample();
        other.title = "Backup Database".into();
        other.trigger = "backup database".into();
        other.status = ProcedureStatus::Usable;
        other.weight = 4.5;
        let md = to_markdown(&[sample(), other.clone()]);
        let parsed = parse_markdown(&md);
        assert_eq!(parsed, vec![other, sample()]);
    }

    #[test]
    fn parses_legacy_frequency_and_defaults() {
        let md = "# PROCEDURES\n\n## Restart Service\nFrequency: 4\nSteps:\n- stop it\n- start it\n";
        let parsed = parse_markdown(md);
        assert_eq!(parsed.len(), 1);
        let p = &parsed[0];
        assert_eq!(p.trigger, "Restart Service");
        assert!((p.weight - 4.0).abs() < f64::EPSILON);
        assert_eq!(p.status, ProcedureStatus::Permanent);
        assert_eq!(p.steps, vec!["stop it", "start it"]);
        assert_eq!(p.first_seen, p.last_seen);
    }

    #[test]
    fn steps_stop_at_next_field() {
        let md = "## T\nSteps:\n1. one\nTrigger: t\n2. stray\n";
        let parsed = parse_markdown(md);
        assert_eq!(parsed[0].steps, vec!["one"]);
        assert_eq!(parsed[0].trigger, "t");
    }

    #[test]
    fn invalid_weight_defaults_to_one() {
        let parsed = parse_markdown("## T\nTrigger: t\nWeight: lots\nSteps:\n1. a\n");
        assert!((parsed[0].weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serialization_drops_incomplete_entries() {
        let mut no_steps = sample();
        no_steps.steps.clear();
        assert_eq!(to_markdown(&[no_steps]), "# PROCEDURES\n");
    }

    #[test]
    fn empty_document_detection() {
        assert!(is_empty_procedure_document(""));
        assert!(is_empty_procedure_document("# PROCEDURES\n\n"));
        assert!(is_empty_procedure_document("  # procedures  "));
        assert!(!is_empty_procedure_document("# PROCEDURES\nhello"));
    }

    #[test]
    fn validate_rejects_freeform_text() {
        assert_matches!(
            validate_document("just some notes"),
            Err(MemoryError::Validation(msg)) if msg == INVALID_DOCUMENT_MESSAGE
        );
        assert!(validate_document("# PROCEDURES\n").unwrap().is_empty());
        assert_eq!(validate_document(&to_markdown(&[sample()])).unwrap().len(), 1);
    }

    #[test]
    fn step_line_variants() {
        assert_eq!(parse_step_line("1. Run tests"), Some("Run tests"));
        assert_eq!(parse_step_line("  2) Build  "), Some("Build"));
        assert_eq!(parse_step_line("3: Ship"), Some("Ship"));
        assert_eq!(parse_step_line("* Verify"), Some("Verify"));
        assert_eq!(parse_step_line("Run tests"), None);
        assert_eq!(parse_step_line("1.Run"), None);
    }
}
