//! # lobster-core
//!
//! Foundation types shared by every g3lobster crate.
//!
//! - **Branded IDs**: [`RunId`], [`TaskId`], [`EventId`] as newtypes for type safety
//! - **Tasks**: [`Task`] with priority bands, status lifecycle, and an ordered event log
//! - **Logging**: [`logging::init_subscriber`] for `tracing` setup
//! - **Atomic writes**: [`fs::atomic_write`] temp-file + fsync + rename
//! - **Text helpers**: whitespace normalisation and char-safe truncation

#![deny(unsafe_code)]

pub mod fs;
pub mod ids;
pub mod logging;
pub mod task;
pub mod text;

pub use ids::{EventId, RunId, TaskId};
pub use task::{Task, TaskEvent, TaskPriority, TaskStatus};
