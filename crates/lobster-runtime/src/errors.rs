//! Runtime error types.

use lobster_memory::MemoryError;
use thiserror::Error;

use crate::state::AgentState;

/// Failures of an [`ExecutionBackend`](crate::backend::ExecutionBackend) call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// `ask` was called before `spawn`, or after `kill`.
    #[error("backend is not initialised (call spawn first)")]
    NotReady,

    /// The prompt did not finish within its timeout.
    #[error("backend timed out after {0:.1}s")]
    Timeout(f64),

    /// The process exited unsuccessfully.
    #[error("backend exited with code {code}: {stderr}")]
    NonZeroExit {
        /// Exit code (`-1` when killed by a signal).
        code: i32,
        /// Trimmed stderr.
        stderr: String,
    },

    /// The in-flight call was interrupted by `kill`.
    #[error("backend was killed")]
    Killed,

    /// The process could not be launched or awaited.
    #[error("backend process error: {0}")]
    Process(#[from] std::io::Error),
}

impl BackendError {
    /// Whether resubmitting the same prompt may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::NonZeroExit { .. } | Self::Killed => true,
            Self::NotReady | Self::Process(_) => false,
        }
    }

    /// Error category string for event emission.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Timeout(_) => "timeout",
            Self::NonZeroExit { .. } => "nonzero_exit",
            Self::Killed => "killed",
            Self::Process(_) => "process",
        }
    }
}

/// Errors raised by the agent runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Caller input rejected before any state changed. The message is user-facing.
    #[error("{0}")]
    Validation(String),

    /// Requested capabilities are missing from the catalog.
    #[error("Unknown MCP server(s): {}", .0.join(", "))]
    UnknownCapabilities(Vec<String>),

    /// No running agent with this id.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// No delegation run with this id.
    #[error("Unknown delegation run: {0}")]
    UnknownRun(String),

    /// The agent cannot take work in its current state.
    #[error("Agent {0} is not ready")]
    AgentNotReady(String),

    /// A state change the lifecycle does not allow.
    #[error("invalid agent state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: AgentState,
        /// Requested state.
        to: AgentState,
    },

    /// Execution backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Memory subsystem failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Filesystem failure.
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("runtime JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether the caller may retry the same operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_recoverable(),
            Self::AgentNotReady(_) => true,
            Self::Validation(_)
            | Self::UnknownCapabilities(_)
            | Self::UnknownAgent(_)
            | Self::UnknownRun(_)
            | Self::InvalidTransition { .. }
            | Self::Memory(_)
            | Self::Io(_)
            | Self::Json(_) => false,
        }
    }

    /// Error category string for event emission.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::UnknownCapabilities(_) => "validation",
            Self::UnknownAgent(_) => "unknown_agent",
            Self::UnknownRun(_) => "unknown_run",
            Self::AgentNotReady(_) => "not_ready",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Backend(_) => "backend",
            Self::Memory(e) => e.category(),
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capabilities_message() {
        let err = RuntimeError::UnknownCapabilities(vec!["alpha".into(), "beta".into()]);
        assert_eq!(err.to_string(), "Unknown MCP server(s): alpha, beta");
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn backend_errors_pass_through() {
        let err: RuntimeError = BackendError::NonZeroExit {
            code: 2,
            stderr: "bad flag".into(),
        }
        .into();
        assert_eq!(err.to_string(), "backend exited with code 2: bad flag");
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "backend");
    }

    #[test]
    fn recoverability() {
        assert!(BackendError::Timeout(1.5).is_recoverable());
        assert!(!BackendError::NotReady.is_recoverable());
        assert!(!RuntimeError::Validation("x".into()).is_recoverable());
        assert_eq!(BackendError::Timeout(1.5).to_string(), "backend timed out after 1.5s");
    }

    #[test]
    fn memory_category_is_forwarded() {
        let err: RuntimeError = MemoryError::Validation("nope".into()).into();
        assert_eq!(err.category(), "validation");
        assert_eq!(err.to_string(), "nope");
    }
}
