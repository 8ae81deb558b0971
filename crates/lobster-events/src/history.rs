//! Per-agent JSONL event history.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{EventsError, Result};
use crate::types::AgentEvent;

/// Reject agent ids that could escape the events directory.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty()
        || trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('\0')
    {
        return Err(EventsError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

pub(crate) fn events_path(dir: &Path, agent_id: &str) -> PathBuf {
    dir.join(agent_id).join("events.jsonl")
}

/// Read the newest `limit` events from a JSONL file, oldest first.
///
/// Malformed lines are skipped. A missing file is an empty history.
pub(crate) fn read_tail(path: &Path, limit: usize) -> Result<Vec<AgentEvent>> {
    let limit = limit.max(1);
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tail = VecDeque::with_capacity(limit);
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AgentEvent>(&line) {
            Ok(event) => {
                if tail.len() == limit {
                    let _ = tail.pop_front();
                }
                tail.push_back(event);
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped malformed event lines");
    }
    Ok(tail.into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_agent_id_cases() {
        assert!(validate_agent_id("alpha").is_ok());
        assert!(validate_agent_id("alpha-2").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("..").is_err());
        assert!(validate_agent_id("a/b").is_err());
        assert!(validate_agent_id("a\\b").is_err());
        assert!(validate_agent_id("x..y").is_err());
    }

    #[test]
    fn read_tail_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let good = serde_json::json!({
            "event_id": "e1", "run_id": "r", "agent_id": "a", "seq": 1,
            "stream": "memory", "type": "tick", "timestamp": "2026-01-01T00:00:00Z",
            "data": {}
        });
        std::fs::write(&path, format!("{good}\nnot-json\n\n{good}\n")).unwrap();
        let events = read_tail(&path, 10).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn read_tail_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_tail(&dir.path().join("nope.jsonl"), 5).unwrap().is_empty());
    }
}
