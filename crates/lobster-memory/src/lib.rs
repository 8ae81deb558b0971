//! # lobster-memory
//!
//! Per-agent memory for g3lobster.
//!
//! - **Sessions**: append-only JSONL transcripts with atomic rewrite and a
//!   per-session async guard ([`SessionStore`])
//! - **Compaction**: threshold-triggered summarization of old messages
//!   ([`CompactionEngine`], [`ChunkSummarizer`])
//! - **Procedures**: learned trigger → steps associations that accumulate
//!   weight, decay, and get promoted ([`procedures`])
//! - **Manager**: the per-agent facade tying the above together
//!   ([`MemoryManager`]) plus shared cross-agent memory
//!   ([`GlobalMemoryManager`])
//! - **Context**: prompt assembly for the next backend call ([`ContextBuilder`])

#![deny(unsafe_code)]

pub mod compactor;
pub mod context;
pub mod errors;
pub mod global;
pub mod manager;
pub mod migration;
pub mod procedures;
pub mod sessions;
pub mod summarizer;

pub use compactor::{CompactionConfig, CompactionEngine};
pub use context::{ContextBuilder, PeerAgent, PeerProvider, summarize_soul};
pub use errors::{MemoryError, Result};
pub use global::GlobalMemoryManager;
pub use manager::{MemoryConfig, MemoryManager};
pub use procedures::{Procedure, ProcedureStatus};
pub use sessions::{CompactionRecord, MessageEntry, SessionEntry, SessionStore, sanitize_session_id};
pub use summarizer::{ChunkSummarizer, CliSummarizer};
