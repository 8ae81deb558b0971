//! # lobster-runtime
//!
//! Agent runtime for g3lobster.
//!
//! - **Personas**: on-disk agent identities under `data/agents/<id>/`
//!   ([`PersonaStore`])
//! - **Backends**: one-shot CLI execution with timeout and cancellation
//!   ([`ExecutionBackend`], [`CliBackend`]) scoped by MCP capabilities
//!   ([`CapabilityResolver`])
//! - **Workers**: the lifecycle state machine around a backend
//!   ([`Worker`], [`AgentWorker`])
//! - **Registry**: per-agent serialization, delegation and the health loop
//!   ([`AgentRegistry`], [`SubagentRegistry`])

#![deny(unsafe_code)]

pub mod backend;
pub mod capabilities;
pub mod errors;
pub mod health;
pub mod persona;
pub mod registry;
pub mod state;
pub mod subagent;
pub mod worker;

#[cfg(test)]
mod testing;

pub use backend::{CliBackend, ExecutionBackend, clean_output};
pub use capabilities::{CapabilityResolver, McpServer};
pub use errors::{BackendError, Result, RuntimeError};
pub use health::{HealthIssue, HealthIssueKind, WorkerSnapshot, inspect};
pub use persona::{Persona, PersonaStore, slugify};
pub use registry::{AgentRegistry, AgentStatus, RegistryConfig, RuntimeHandle};
pub use state::AgentState;
pub use subagent::{DEFAULT_DELEGATION_TIMEOUT_S, RunStatus, SubagentRegistry, SubagentRun};
pub use worker::{AgentWorker, CliWorkerFactory, Worker, WorkerFactory};
