//! Stateless detection of dead and stuck workers.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::state::AgentState;

/// Point-in-time view of one worker.
#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    /// Agent id.
    pub agent_id: String,
    /// Lifecycle state.
    pub state: AgentState,
    /// When the current assignment began.
    pub busy_since: Option<Instant>,
    /// Result of the aliveness probe.
    pub alive: bool,
}

/// Kind of problem found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    /// Busy longer than the stuck timeout.
    Stuck,
    /// Not busy, not stopped or starting, and failing the aliveness probe.
    Dead,
}

impl HealthIssueKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stuck => "stuck",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for HealthIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    /// Affected agent.
    pub agent_id: String,
    /// What is wrong.
    pub kind: HealthIssueKind,
}

/// Inspect `snapshots` at time `now`.
pub fn inspect(snapshots: &[WorkerSnapshot], stuck_timeout: Duration, now: Instant) -> Vec<HealthIssue> {
    snapshots
        .iter()
        .filter_map(|s| {
            let kind = if s.state == AgentState::Busy {
                let busy_for = s.busy_since.map(|t| now.saturating_duration_since(t))?;
                (busy_for > stuck_timeout).then_some(HealthIssueKind::Stuck)?
            } else {
                let exempt = matches!(s.state, AgentState::Stopped | AgentState::Starting);
                (!s.alive && !exempt).then_some(HealthIssueKind::Dead)?
            };
            Some(HealthIssue {
                agent_id: s.agent_id.clone(),
                kind,
            })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, state: AgentState, busy_secs: Option<u64>, alive: bool, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            agent_id: id.into(),
            state,
            busy_since: busy_secs.and_then(|s| now.checked_sub(Duration::from_secs(s))),
            alive,
        }
    }

    #[test]
    fn detects_stuck_and_dead() {
        let now = Instant::now();
        let snaps = vec![
            snap("stuck", AgentState::Busy, Some(120), true, now),
            snap("working", AgentState::Busy, Some(5), true, now),
            snap("dead", AgentState::Idle, None, false, now),
            snap("fine", AgentState::Idle, None, true, now),
        ];
        let issues = inspect(&snaps, Duration::from_secs(60), now);
        assert_eq!(
            issues,
            vec![
                HealthIssue { agent_id: "stuck".into(), kind: HealthIssueKind::Stuck },
                HealthIssue { agent_id: "dead".into(), kind: HealthIssueKind::Dead },
            ]
        );
    }

    #[test]
    fn stopped_and_starting_are_never_dead() {
        let now = Instant::now();
        let snaps = vec![
            snap("s", AgentState::Stopped, None, false, now),
            snap("t", AgentState::Starting, None, false, now),
        ];
        assert!(inspect(&snaps, Duration::from_secs(60), now).is_empty());
    }

    #[test]
    fn busy_dead_worker_is_only_reported_when_stuck() {
        let now = Instant::now();
        let snaps = vec![
            snap("a", AgentState::Busy, Some(1), false, now),
            snap("b", AgentState::Busy, None, false, now),
        ];
        assert!(inspect(&snaps, Duration::from_secs(60), now).is_empty());
    }

    #[test]
    fn dead_state_with_failed_probe_is_reported() {
        let now = Instant::now();
        let snaps = vec![snap("d", AgentState::Dead, None, false, now)];
        let issues = inspect(&snaps, Duration::from_secs(60), now);
        assert_eq!(issues[0].kind, HealthIssueKind::Dead);
        assert_eq!(issues[0].kind.to_string(), "dead");
    }
}
