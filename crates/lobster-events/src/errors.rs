//! Event error types.

use thiserror::Error;

/// Errors raised while reading event history.
#[derive(Debug, Error)]
pub enum EventsError {
    /// The agent id would escape the events directory.
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
    /// Reading the history file failed.
    #[error("event history I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EventsError {
    /// Error category string.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidAgentId(_) => "validation",
            Self::Io(_) => "io",
        }
    }
}

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventsError>;
