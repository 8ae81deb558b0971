//! Agent pool, memory, and health settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Agent pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsSettings {
    /// Root directory holding personas, per-agent memory, and run tables.
    pub data_dir: PathBuf,
    /// Message count at which a session is compacted.
    pub compact_threshold: usize,
    /// Fraction of messages kept verbatim on compaction (clamped to 0.05–0.9).
    pub compact_keep_ratio: f64,
    /// Messages per summarizer call.
    pub compact_chunk_size: usize,
    /// Mine procedure candidates every N appended messages.
    pub candidate_extract_interval: usize,
    /// `##` sections retained in an agent's notes document.
    pub memory_max_sections: usize,
    /// Recent messages included in the prompt context.
    pub context_messages: usize,
    /// Matched procedures included in the prompt context.
    pub procedure_limit: usize,
    /// Health loop period in seconds.
    pub health_check_interval_s: u64,
    /// Seconds an agent may stay busy before it is considered stuck.
    pub stuck_timeout_s: u64,
    /// Default delegation timeout in seconds.
    pub delegation_timeout_s: f64,
}

impl Default for AgentsSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 40,
            compact_keep_ratio: 0.25,
            compact_chunk_size: 10,
            candidate_extract_interval: 10,
            memory_max_sections: 50,
            context_messages: 12,
            procedure_limit: 3,
            health_check_interval_s: 30,
            stuck_timeout_s: 300,
            delegation_timeout_s: 300.0,
        }
    }
}
