//! Workers: one agent bound to a backend, memory and context builder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lobster_core::{RunId, Task, TaskId};
use lobster_events::{EventEmitter, streams};
use lobster_memory::ContextBuilder;
use lobster_settings::BackendSettings;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::{CliBackend, ExecutionBackend};
use crate::capabilities::CapabilityResolver;
use crate::errors::{Result, RuntimeError};
use crate::health::WorkerSnapshot;
use crate::persona::Persona;
use crate::state::AgentState;

/// Backend timeout used when a task carries an unusable one.
const FALLBACK_TASK_TIMEOUT: Duration = Duration::from_secs(120);

/// A managed agent as seen by the registry.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Agent id.
    fn id(&self) -> &str;
    /// Lifecycle state.
    fn state(&self) -> AgentState;
    /// Task currently executing.
    fn current_task(&self) -> Option<TaskId>;
    /// Resolved capability scope.
    fn capabilities(&self) -> Vec<String>;
    /// Start of the current assignment.
    fn busy_since(&self) -> Option<Instant>;
    /// Creation time.
    fn started_at(&self) -> DateTime<Utc>;
    /// Backend aliveness probe.
    fn is_alive(&self) -> bool;

    /// `Starting → Idle`: resolve `scope` and spawn the backend.
    async fn start(&self, scope: &[String]) -> Result<()>;
    /// Kill the backend and move to `Stopped`.
    async fn stop(&self);
    /// Execute `task`. Backend and memory failures end up in the returned
    /// task as `Failed`; only an agent that cannot take work is an `Err`.
    async fn assign(&self, task: Task) -> Result<Task>;

    /// Health-check view.
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            agent_id: self.id().to_string(),
            state: self.state(),
            busy_since: self.busy_since(),
            alive: self.is_alive(),
        }
    }
}

/// Builds the worker for a persona.
pub trait WorkerFactory: Send + Sync {
    /// Create a fresh, not yet started worker.
    fn create(&self, persona: &Persona, context: Arc<ContextBuilder>) -> Arc<dyn Worker>;
}

struct Slot {
    state: AgentState,
    current_task: Option<TaskId>,
    busy_since: Option<Instant>,
    capabilities: Vec<String>,
}

/// The concrete worker: context → transcript → backend → transcript.
pub struct AgentWorker {
    id: String,
    backend: Arc<dyn ExecutionBackend>,
    resolver: Arc<CapabilityResolver>,
    context: Arc<ContextBuilder>,
    emitter: Arc<EventEmitter>,
    started_at: DateTime<Utc>,
    slot: Mutex<Slot>,
}

impl AgentWorker {
    /// A worker in `Starting`.
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn ExecutionBackend>,
        resolver: Arc<CapabilityResolver>,
        context: Arc<ContextBuilder>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            resolver,
            context,
            emitter,
            started_at: Utc::now(),
            slot: Mutex::new(Slot {
                state: AgentState::Starting,
                current_task: None,
                busy_since: None,
                capabilities: Vec::new(),
            }),
        }
    }

    fn transition(&self, to: AgentState) -> Result<()> {
        let mut slot = self.slot.lock();
        if !slot.state.can_transition_to(to) {
            return Err(RuntimeError::InvalidTransition { from: slot.state, to });
        }
        debug!(agent_id = %self.id, from = %slot.state, to = %to, "agent state changed");
        slot.state = to;
        Ok(())
    }

    fn emit(&self, run_id: &RunId, stream: &str, event_type: &str, data: Value, session_id: Option<&str>) {
        let _ = self.emitter.emit(&self.id, run_id, stream, event_type, data, session_id);
    }

    async fn execute(&self, task: &Task, run_id: &RunId) -> Result<String> {
        let memory = self.context.memory();
        let prompt = self.context.build(&task.session_id, &task.prompt)?;
        let meta = json!({ "task_id": task.id });
        let _ = memory
            .append_message(&task.session_id, "user", &task.prompt, Some(meta.clone()))
            .await?;

        let timeout = Duration::try_from_secs_f64(task.timeout_s).unwrap_or(FALLBACK_TASK_TIMEOUT);
        let started = Instant::now();
        let reply = match self.backend.ask(&prompt, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.emit(
                    run_id,
                    streams::BACKEND,
                    "backend.failed",
                    json!({ "category": e.category(), "error": e.to_string() }),
                    Some(&task.session_id),
                );
                return Err(e.into());
            }
        };
        self.emit(
            run_id,
            streams::BACKEND,
            "backend.completed",
            json!({
                "prompt_length": prompt.len(),
                "output_length": reply.len(),
                "duration_ms": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
            Some(&task.session_id),
        );

        let _ = memory
            .append_message(&task.session_id, "assistant", &reply, Some(meta))
            .await?;
        Ok(reply)
    }
}

#[async_trait]
impl Worker for AgentWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> AgentState {
        self.slot.lock().state
    }

    fn current_task(&self) -> Option<TaskId> {
        self.slot.lock().current_task.clone()
    }

    fn capabilities(&self) -> Vec<String> {
        self.slot.lock().capabilities.clone()
    }

    fn busy_since(&self) -> Option<Instant> {
        self.slot.lock().busy_since
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn is_alive(&self) -> bool {
        self.backend.is_alive()
    }

    async fn start(&self, scope: &[String]) -> Result<()> {
        let resolved = self.resolver.resolve(scope)?;
        self.backend.spawn(&resolved).await?;
        self.slot.lock().capabilities.clone_from(&resolved);
        self.transition(AgentState::Idle)?;
        self.emit(
            &RunId::new(),
            streams::LIFECYCLE,
            "agent.started",
            json!({ "capabilities": resolved }),
            None,
        );
        info!(agent_id = %self.id, capabilities = ?resolved, "agent started");
        Ok(())
    }

    async fn stop(&self) {
        self.backend.kill().await;
        {
            let mut slot = self.slot.lock();
            slot.state = AgentState::Stopped;
            slot.busy_since = None;
        }
        self.emit(&RunId::new(), streams::LIFECYCLE, "agent.stopped", Value::Null, None);
        info!(agent_id = %self.id, "agent stopped");
    }

    async fn assign(&self, mut task: Task) -> Result<Task> {
        let run_id = RunId::new();
        let started = Instant::now();
        {
            let mut slot = self.slot.lock();
            if !slot.state.accepts_work() {
                return Err(RuntimeError::AgentNotReady(self.id.clone()));
            }
            slot.state = AgentState::Busy;
            slot.current_task = Some(task.id.clone());
            slot.busy_since = Some(started);
        }

        task.mark_running(&self.id);
        self.emit(
            &run_id,
            streams::LIFECYCLE,
            "task.assigned",
            json!({
                "task_id": task.id,
                "prompt_length": task.prompt.len(),
                "session_id": task.session_id,
            }),
            Some(&task.session_id),
        );

        let span = info_span!("assign", agent_id = %self.id, task_id = %task.id, run_id = %run_id);
        match self.execute(&task, &run_id).instrument(span).await {
            Ok(reply) => task.complete(reply),
            Err(e) => {
                warn!(agent_id = %self.id, task_id = %task.id, error = %e, "task failed");
                task.fail(e.to_string());
            }
        }

        let alive = self.backend.is_alive();
        {
            let mut slot = self.slot.lock();
            slot.current_task = None;
            slot.busy_since = None;
            if slot.state == AgentState::Busy {
                slot.state = if alive { AgentState::Idle } else { AgentState::Dead };
            }
        }

        self.emit(
            &run_id,
            streams::LIFECYCLE,
            "task.completed",
            json!({
                "task_id": task.id,
                "status": task.status.as_str(),
                "result_length": task.result.as_ref().map_or(0, String::len),
                "duration_s": started.elapsed().as_secs_f64(),
            }),
            Some(&task.session_id),
        );
        Ok(task)
    }
}

/// Builds [`AgentWorker`]s driving a [`CliBackend`].
pub struct CliWorkerFactory {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    resolver: Arc<CapabilityResolver>,
    emitter: Arc<EventEmitter>,
}

impl CliWorkerFactory {
    /// Factory using the backend settings section.
    pub fn new(settings: &BackendSettings, resolver: Arc<CapabilityResolver>, emitter: Arc<EventEmitter>) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            cwd: Some(settings.workspace_dir.clone()),
            resolver,
            emitter,
        }
    }
}

impl WorkerFactory for CliWorkerFactory {
    fn create(&self, persona: &Persona, context: Arc<ContextBuilder>) -> Arc<dyn Worker> {
        let mut backend = CliBackend::new(&self.command, self.args.clone()).with_model(&persona.model);
        if let Some(cwd) = &self.cwd {
            backend = backend.with_cwd(cwd);
        }
        Arc::new(AgentWorker::new(
            persona.id.clone(),
            Arc::new(backend),
            Arc::clone(&self.resolver),
            context,
            Arc::clone(&self.emitter),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::McpServer;
    use crate::testing::{FakeBackend, context_for};
    use assert_matches::assert_matches;
    use lobster_core::TaskStatus;
    use tempfile::TempDir;

    fn worker(dir: &TempDir, backend: Arc<FakeBackend>) -> (AgentWorker, Arc<EventEmitter>) {
        let emitter = Arc::new(EventEmitter::in_memory());
        let resolver = Arc::new(CapabilityResolver::from_servers([McpServer {
            name: "github".into(),
            ..McpServer::default()
        }]));
        let w = AgentWorker::new("alpha", backend, resolver, context_for(dir, "alpha"), Arc::clone(&emitter));
        (w, emitter)
    }

    #[tokio::test]
    async fn start_resolves_scope_and_becomes_idle() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let (w, _) = worker(&dir, Arc::clone(&backend));
        assert_eq!(w.state(), AgentState::Starting);
        w.start(&["github".to_string()]).await.unwrap();
        assert_eq!(w.state(), AgentState::Idle);
        assert_eq!(w.capabilities(), vec!["github"]);
        assert_eq!(backend.scope(), vec!["github"]);
    }

    #[tokio::test]
    async fn start_rejects_unknown_capability() {
        let dir = TempDir::new().unwrap();
        let (w, _) = worker(&dir, Arc::new(FakeBackend::new()));
        let err = w.start(&["jira".to_string()]).await.unwrap_err();
        assert_eq!(err.to_string(), "Unknown MCP server(s): jira");
        assert_eq!(w.state(), AgentState::Starting);
    }

    #[tokio::test]
    async fn assign_before_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (w, _) = worker(&dir, Arc::new(FakeBackend::new()));
        assert_matches!(w.assign(Task::new("x", "s")).await, Err(RuntimeError::AgentNotReady(_)));
    }

    #[tokio::test]
    async fn successful_assignment_records_transcript_and_events() {
        let dir = TempDir::new().unwrap();
        let (w, emitter) = worker(&dir, Arc::new(FakeBackend::new()));
        w.start(&[]).await.unwrap();

        let task = w.assign(Task::new("summarize logs", "s1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done: summarize logs"));
        assert_eq!(w.state(), AgentState::Idle);
        assert!(w.current_task().is_none());

        let transcript = w.context.memory().read_messages("s1", None).unwrap();
        let lines: Vec<(String, &str)> = transcript.iter().map(|m| (m.role(), m.content())).collect();
        assert_eq!(
            lines,
            vec![
                ("user".to_string(), "summarize logs"),
                ("assistant".to_string(), "done: summarize logs"),
            ]
        );

        let types: Vec<String> = emitter
            .recent_events(Some("alpha"), Some(streams::LIFECYCLE), 10)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["agent.started", "task.assigned", "task.completed"]);
    }

    #[tokio::test]
    async fn backend_failure_fails_task_not_agent() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new().failing("quota exceeded"));
        let (w, _) = worker(&dir, backend);
        w.start(&[]).await.unwrap();

        let task = w.assign(Task::new("x", "s1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("quota exceeded"));
        assert_eq!(w.state(), AgentState::Idle);
        assert_eq!(w.context.memory().read_messages("s1", None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backend_death_marks_agent_dead() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new().dying());
        let (w, _) = worker(&dir, backend);
        w.start(&[]).await.unwrap();

        let task = w.assign(Task::new("x", "s1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(w.state(), AgentState::Dead);
        assert_matches!(w.assign(Task::new("y", "s1")).await, Err(RuntimeError::AgentNotReady(_)));
    }

    #[tokio::test]
    async fn stop_kills_backend() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let (w, _) = worker(&dir, Arc::clone(&backend));
        w.start(&[]).await.unwrap();
        w.stop().await;
        assert_eq!(w.state(), AgentState::Stopped);
        assert!(!backend.is_alive());
        assert!(!w.snapshot().alive);
    }
}
