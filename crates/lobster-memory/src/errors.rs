//! Memory error types.

use thiserror::Error;

/// Errors raised by the memory subsystem.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Filesystem failure (session rewrite, notes, procedure files).
    #[error("memory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be encoded or decoded.
    #[error("memory JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// User-supplied content was rejected before any write.
    #[error("{0}")]
    Validation(String),

    /// The chunk summarizer failed; callers fall back to a metadata summary.
    #[error("summarizer failed: {0}")]
    Summarizer(String),
}

impl MemoryError {
    /// Error category string for logging and API mapping.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Validation(_) => "validation",
            Self::Summarizer(_) => "summarizer",
        }
    }
}

/// Result type for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
