//! Agent lifecycle state machine.
//!
//! ```text
//! Starting ──► Idle ◄──► Busy ──► Dead
//!    │          │         │        │
//!    └──────────┴────┬────┴────────┘
//!                    ▼
//!                 Stopped
//! ```
//!
//! `Dead` only leaves through `Starting` (an external restart) or `Stopped`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one agent worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Backend is being spawned.
    Starting,
    /// Ready for work.
    Idle,
    /// Executing a task.
    Busy,
    /// Backend failed its aliveness probe.
    Dead,
    /// Explicitly stopped.
    Stopped,
}

impl AgentState {
    /// Whether `self → next` is a legal transition.
    ///
    /// `Busy → Busy` is accepted: the per-agent gate, not the state field,
    /// serializes assignments.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Idle)
                | (Self::Idle | Self::Busy, Self::Busy)
                | (Self::Busy, Self::Idle | Self::Dead)
                | (Self::Dead, Self::Starting)
                | (Self::Starting | Self::Idle | Self::Busy | Self::Dead, Self::Stopped)
        )
    }

    /// Whether the agent accepts an assignment.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Dead => "dead",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::{Busy, Dead, Idle, Starting, Stopped};

    #[test]
    fn happy_path() {
        assert!(Starting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Busy.can_transition_to(Dead));
        assert!(Dead.can_transition_to(Starting));
    }

    #[test]
    fn stop_from_any_live_state() {
        for s in [Starting, Idle, Busy, Dead] {
            assert!(s.can_transition_to(Stopped), "{s} -> stopped");
        }
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Stopped.can_transition_to(Idle));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Dead.can_transition_to(Idle));
        assert!(!Dead.can_transition_to(Busy));
        assert!(!Starting.can_transition_to(Busy));
        assert!(!Idle.can_transition_to(Dead));
    }

    #[test]
    fn work_acceptance() {
        assert!(Idle.accepts_work());
        assert!(Busy.accepts_work());
        assert!(!Starting.accepts_work());
        assert!(!Dead.accepts_work());
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&Stopped).unwrap(), "\"stopped\"");
        assert_eq!(Busy.to_string(), "busy");
    }
}
