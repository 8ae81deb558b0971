//! Execution backend and capability catalog settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// External CLI backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Executable invoked once per prompt.
    pub command: String,
    /// Arguments placed before the prompt flag.
    pub args: Vec<String>,
    /// Working directory for backend processes.
    pub workspace_dir: PathBuf,
    /// Per-prompt timeout in seconds.
    pub response_timeout_s: f64,
    /// Timeout for compaction summary calls (never below 5 seconds).
    pub summary_timeout_s: f64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec!["-y".to_string()],
            workspace_dir: PathBuf::from("."),
            response_timeout_s: 120.0,
            summary_timeout_s: 45.0,
        }
    }
}

/// Capability catalog settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpSettings {
    /// Directory of `*.json` server definitions.
    pub config_dir: PathBuf,
    /// Scope used when a persona does not name one.
    pub default_servers: Vec<String>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("./config/mcp"),
            default_servers: vec!["*".to_string()],
        }
    }
}
