//! Event record types.

use chrono::{DateTime, Utc};
use lobster_core::EventId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known stream tags.
pub mod streams {
    /// Agent start/stop/restart and task assignment.
    pub const LIFECYCLE: &str = "lifecycle";
    /// Memory writes and compaction.
    pub const MEMORY: &str = "memory";
    /// Execution backend calls.
    pub const BACKEND: &str = "backend";
    /// Delegation runs.
    pub const DELEGATION: &str = "delegation";
}

/// One emitted event.
///
/// `seq` is scoped to `run_id`, starts at 1, and is never reused.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Unique event id.
    pub event_id: EventId,
    /// Run the event belongs to.
    pub run_id: String,
    /// Agent that produced the event.
    pub agent_id: String,
    /// Per-run sequence number.
    pub seq: u64,
    /// Stream tag (see [`streams`]).
    pub stream: String,
    /// Event type within the stream.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary structured payload.
    #[serde(default)]
    pub data: Value,
    /// Session the event relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
