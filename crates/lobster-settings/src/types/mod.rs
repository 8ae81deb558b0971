//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. `#[serde(default)]` on every struct
//! lets a settings file specify only the fields it changes.

mod agents;
mod backend;

pub use agents::*;
pub use backend::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "agents": { "dataDir": "./data", "compactThreshold": 40 },
///   "backend": { "command": "gemini", "args": ["-y"] }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobsterSettings {
    /// Agent pool, memory, and health settings.
    pub agents: AgentsSettings,
    /// External execution backend (CLI) settings.
    pub backend: BackendSettings,
    /// Capability (MCP server) catalog settings.
    pub mcp: McpSettings,
    /// Event emitter settings.
    pub events: EventSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl LobsterSettings {
    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.backend.command.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "backend.command must not be empty".into(),
            ));
        }
        if !self.agents.compact_keep_ratio.is_finite() {
            return Err(SettingsError::InvalidValue(
                "agents.compactKeepRatio must be a finite number".into(),
            ));
        }
        Ok(())
    }
}

/// Event emitter settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSettings {
    /// Size of the in-memory recent-events ring buffer.
    pub max_recent: usize,
    /// Whether to append events to per-agent JSONL files.
    pub persist: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            max_recent: 500,
            persist: true,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
