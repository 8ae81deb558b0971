//! # lobster-events
//!
//! Process-wide event bus for agent activity.
//!
//! - [`EventEmitter`] assigns per-run sequence numbers, notifies listeners
//!   synchronously, fans out to broadcast subscribers, keeps a bounded ring
//!   of recent events, and optionally appends JSON lines per agent.
//! - [`AgentEvent`] is the append-only record.
//!
//! One emitter is built at process start and shared by `Arc`.

#![deny(unsafe_code)]

pub mod emitter;
pub mod errors;
pub mod history;
pub mod types;

pub use emitter::{EventEmitter, EventListener, Unsubscribe};
pub use errors::{EventsError, Result};
pub use history::validate_agent_id;
pub use types::{AgentEvent, streams};
