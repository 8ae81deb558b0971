//! Named agent registry.
//!
//! Owns the map from agent id to [`RuntimeHandle`], starts and stops
//! workers, serializes assignments per agent, drives delegation runs and
//! runs the periodic health check.
//!
//! Lock order: the lifecycle lock is taken before any per-agent gate is
//! touched and is never held while waiting on a gate, so a delegation that
//! auto-starts its child cannot deadlock against a running assignment.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use lobster_core::{RunId, Task, TaskId, TaskStatus};
use lobster_events::{EventEmitter, streams};
use lobster_memory::{
    ChunkSummarizer, ContextBuilder, GlobalMemoryManager, MemoryConfig, MemoryManager, PeerAgent, PeerProvider,
    summarize_soul,
};
use lobster_settings::LobsterSettings;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::errors::{Result, RuntimeError};
use crate::health::{HealthIssue, inspect};
use crate::persona::{Persona, PersonaStore};
use crate::subagent::{SubagentRegistry, SubagentRun, UNKNOWN_FAILURE};
use crate::worker::{Worker, WorkerFactory};

/// Registry tuning.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Root holding `agents/` and the delegation run table.
    pub data_dir: PathBuf,
    /// Per-agent memory tuning.
    pub memory: MemoryConfig,
    /// Recent messages included in context.
    pub context_messages: usize,
    /// Matched procedures included in context.
    pub procedure_limit: usize,
    /// Health loop period.
    pub health_check_interval: Duration,
    /// Busy time after which an agent counts as stuck.
    pub stuck_timeout: Duration,
}

impl RegistryConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &LobsterSettings) -> Self {
        let agents = &settings.agents;
        Self {
            data_dir: agents.data_dir.clone(),
            memory: MemoryConfig::from_settings(agents),
            context_messages: agents.context_messages,
            procedure_limit: agents.procedure_limit,
            health_check_interval: Duration::from_secs(agents.health_check_interval_s.max(1)),
            stuck_timeout: Duration::from_secs(agents.stuck_timeout_s),
        }
    }
}

/// A started agent: persona, worker, memory and the assignment gate.
pub struct RuntimeHandle {
    persona: Persona,
    worker: Arc<dyn Worker>,
    memory: Arc<MemoryManager>,
    gate: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RuntimeHandle {
    /// Agent id.
    pub fn id(&self) -> &str {
        &self.persona.id
    }

    /// Persona the agent was started with.
    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// The worker.
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    /// The agent's memory.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Assignments waiting behind the one currently running.
    pub fn pending_assignments(&self) -> usize {
        self.pending.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Run `task` once every earlier assignment on this agent has finished.
    /// The gate is FIFO, so queued assignments run in arrival order.
    pub async fn assign(&self, task: Task) -> Result<Task> {
        let _ = self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&self.pending);
        let _gate = self.gate.lock().await;
        self.worker.assign(task).await
    }
}

/// One row of [`AgentRegistry::status`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStatus {
    /// Agent id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Display emoji.
    pub emoji: String,
    /// Whether `start_all` starts it.
    pub enabled: bool,
    /// External chat bot identity.
    pub bot_user_id: Option<String>,
    /// Model name.
    pub model: String,
    /// Resolved (running) or configured (stopped) capability scope.
    pub mcp_servers: Vec<String>,
    /// Lifecycle state (`stopped` when not running).
    pub state: String,
    /// Seconds since the worker was created.
    pub uptime_s: i64,
    /// Task currently executing.
    pub current_task: Option<TaskId>,
    /// Assignments queued behind it.
    pub pending_assignments: usize,
}

/// Manages named agents and their per-agent runtime dependencies.
pub struct AgentRegistry {
    config: RegistryConfig,
    personas: Arc<PersonaStore>,
    subagents: SubagentRegistry,
    factory: Arc<dyn WorkerFactory>,
    summarizer: Arc<dyn ChunkSummarizer>,
    global: Option<Arc<GlobalMemoryManager>>,
    emitter: Arc<EventEmitter>,
    agents: DashMap<String, Arc<RuntimeHandle>>,
    lifecycle: tokio::sync::Mutex<()>,
    health: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AgentRegistry {
    /// Build a registry over `config.data_dir`.
    pub fn new(
        config: RegistryConfig,
        factory: Arc<dyn WorkerFactory>,
        summarizer: Arc<dyn ChunkSummarizer>,
        emitter: Arc<EventEmitter>,
    ) -> Result<Self> {
        let personas = Arc::new(PersonaStore::new(&config.data_dir)?);
        let subagents = SubagentRegistry::new(&config.data_dir);
        Ok(Self {
            config,
            personas,
            subagents,
            factory,
            summarizer,
            global: None,
            emitter,
            agents: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            health: Mutex::new(None),
        })
    }

    /// Share cross-agent memory with every agent's context.
    #[must_use]
    pub fn with_global_memory(mut self, global: Arc<GlobalMemoryManager>) -> Self {
        self.global = Some(global);
        self
    }

    /// Persona store.
    pub fn personas(&self) -> &Arc<PersonaStore> {
        &self.personas
    }

    /// Delegation run table.
    pub fn subagents(&self) -> &SubagentRegistry {
        &self.subagents
    }

    /// Handle of a running agent.
    pub fn get_agent(&self, agent_id: &str) -> Option<Arc<RuntimeHandle>> {
        self.agents.get(agent_id).map(|h| Arc::clone(h.value()))
    }

    /// Whether `agent_id` is running.
    pub fn is_running(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Sorted ids of running agents.
    pub fn running_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start every enabled persona, then the health loop.
    ///
    /// An agent that fails to start is logged and skipped.
    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        for persona in self.personas.list_enabled()? {
            if let Err(e) = self.start_agent(&persona.id).await {
                warn!(agent_id = %persona.id, error = %e, "agent failed to start");
            }
        }
        self.spawn_health_loop();
        Ok(())
    }

    /// Start one agent. Idempotent; `false` when no such persona exists.
    pub async fn start_agent(&self, agent_id: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(agent_id).await
    }

    /// Stop one agent. `false` when it was not running.
    pub async fn stop_agent(&self, agent_id: &str) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked(agent_id).await
    }

    /// Stop (if running) and start again.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let _ = self.stop_locked(agent_id).await;
        self.start_locked(agent_id).await
    }

    /// Cancel the health loop, wait for it, then stop every agent.
    pub async fn stop_all(&self) {
        let health = self.health.lock().take();
        if let Some((cancel, handle)) = health {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "health loop ended abnormally");
            }
        }
        let _lifecycle = self.lifecycle.lock().await;
        for id in self.running_agents() {
            let _ = self.stop_locked(&id).await;
        }
        info!("all agents stopped");
    }

    async fn start_locked(&self, agent_id: &str) -> Result<bool> {
        if self.agents.contains_key(agent_id) {
            return Ok(true);
        }
        let Some(persona) = self.personas.load(agent_id)? else {
            return Ok(false);
        };

        let root = self.personas.agent_dir(agent_id)?;
        let memory = Arc::new(MemoryManager::new(
            root,
            self.config.memory,
            Arc::clone(&self.summarizer),
        )?);
        let mut context = ContextBuilder::new(Arc::clone(&memory))
            .with_preamble(&persona.soul)
            .with_limits(self.config.context_messages, self.config.procedure_limit)
            .with_peers(&persona.id, self.peer_provider());
        if let Some(global) = &self.global {
            context = context.with_global(Arc::clone(global));
        }

        let worker = self.factory.create(&persona, Arc::new(context));
        worker.start(&persona.mcp_servers).await?;

        let handle = Arc::new(RuntimeHandle {
            persona,
            worker,
            memory,
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
        });
        let _ = self.agents.insert(agent_id.to_string(), handle);
        Ok(true)
    }

    async fn stop_locked(&self, agent_id: &str) -> bool {
        let Some((_, handle)) = self.agents.remove(agent_id) else {
            return false;
        };
        handle.worker.stop().await;
        true
    }

    fn peer_provider(&self) -> PeerProvider {
        let personas = Arc::clone(&self.personas);
        Arc::new(move || match personas.list_enabled() {
            Ok(list) => list
                .into_iter()
                .map(|p| PeerAgent {
                    description: summarize_soul(&p.soul),
                    id: p.id,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not list personas for delegation roster");
                Vec::new()
            }
        })
    }

    // ── Work ─────────────────────────────────────────────────────────────

    /// Run `task` on a running agent through its gate. Does not auto-start.
    pub async fn assign(&self, agent_id: &str, task: Task) -> Result<Task> {
        let handle = self
            .get_agent(agent_id)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_id.to_string()))?;
        handle.assign(task).await
    }

    /// Delegate `prompt` from `parent` to `child` and wait for the outcome.
    ///
    /// The child is started on demand. Validation failures are returned as
    /// errors before anything is recorded; every later failure is recorded
    /// on the returned run.
    pub async fn delegate_task(
        &self,
        parent: &str,
        child: &str,
        prompt: &str,
        parent_session_id: &str,
        timeout_s: f64,
    ) -> Result<SubagentRun> {
        let run = self
            .subagents
            .register_run(parent, child, prompt, parent_session_id, timeout_s)?;
        let span = info_span!("delegate", run_id = %run.run_id, parent = %run.parent_agent_id, child = %run.child_agent_id);
        self.drive_run(run).instrument(span).await
    }

    async fn drive_run(&self, run: SubagentRun) -> Result<SubagentRun> {
        let run_id = run.run_id.clone();
        self.emit_run(&run, "run.registered");

        let handle = match self.get_agent(&run.child_agent_id) {
            Some(handle) => handle,
            None => {
                let started = self.start_agent(&run.child_agent_id).await;
                match (started, self.get_agent(&run.child_agent_id)) {
                    (Ok(true), Some(handle)) => handle,
                    (Err(e), _) => {
                        let error = format!("Failed to start agent {}: {e}", run.child_agent_id);
                        return self.finish_failed(&run_id, &error);
                    }
                    _ => {
                        let error = format!("Failed to start agent {}", run.child_agent_id);
                        return self.finish_failed(&run_id, &error);
                    }
                }
            }
        };

        if let Err(e) = self.subagents.mark_running(&run_id) {
            return self.finish_failed(&run_id, &format!("Failed to record run start: {e}"));
        }
        let task = Task::new(&run.task, &run.session_id).with_timeout(run.timeout_s);
        let outcome = match handle.assign(task).await {
            Ok(done) => match (done.status, done.result) {
                (TaskStatus::Completed, Some(result)) if !result.is_empty() => Ok(result),
                _ => Err(done.error.unwrap_or_else(|| UNKNOWN_FAILURE.to_string())),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(result) => match self.subagents.complete_run(&run_id, &result) {
                Ok(Some(done)) => {
                    self.emit_run(&done, "run.completed");
                    info!(status = done.status.as_str(), "delegation finished");
                    Ok(done)
                }
                Ok(None) => Err(RuntimeError::UnknownRun(run_id.to_string())),
                Err(e) => self.finish_failed(&run_id, &format!("Failed to record run result: {e}")),
            },
            Err(error) => self.finish_failed(&run_id, &error),
        }
    }

    fn finish_failed(&self, run_id: &RunId, error: &str) -> Result<SubagentRun> {
        let failed = self
            .subagents
            .fail_run(run_id, error)?
            .ok_or_else(|| RuntimeError::UnknownRun(run_id.to_string()))?;
        warn!(error, "delegation failed");
        self.emit_run(&failed, "run.failed");
        Ok(failed)
    }

    fn emit_run(&self, run: &SubagentRun, event_type: &str) {
        let _ = self.emitter.emit(
            &run.parent_agent_id,
            &run.run_id,
            streams::DELEGATION,
            event_type,
            json!({
                "child_agent_id": run.child_agent_id,
                "status": run.status.as_str(),
                "session_id": run.session_id,
                "error": run.error,
            }),
            Some(&run.parent_session_id),
        );
    }

    /// Delegation run by id.
    pub fn get_run(&self, run_id: &str) -> Option<SubagentRun> {
        self.subagents.get_run(run_id)
    }

    /// Delegation runs, newest first.
    pub fn list_runs(&self, parent: Option<&str>) -> Vec<SubagentRun> {
        self.subagents.list_runs(parent)
    }

    // ── Status and health ────────────────────────────────────────────────

    /// One row per persona on disk.
    pub fn status(&self) -> Result<Vec<AgentStatus>> {
        let now = Utc::now();
        Ok(self
            .personas
            .list()?
            .into_iter()
            .map(|p| match self.get_agent(&p.id) {
                Some(h) => {
                    let worker = h.worker();
                    let capabilities = worker.capabilities();
                    AgentStatus {
                        mcp_servers: if capabilities.is_empty() { p.mcp_servers.clone() } else { capabilities },
                        state: worker.state().to_string(),
                        uptime_s: (now - worker.started_at()).num_seconds().max(0),
                        current_task: worker.current_task(),
                        pending_assignments: h.pending_assignments(),
                        id: p.id,
                        name: p.name,
                        emoji: p.emoji,
                        enabled: p.enabled,
                        bot_user_id: p.bot_user_id,
                        model: p.model,
                    }
                }
                None => AgentStatus {
                    mcp_servers: p.mcp_servers,
                    state: "stopped".to_string(),
                    uptime_s: 0,
                    current_task: None,
                    pending_assignments: 0,
                    id: p.id,
                    name: p.name,
                    emoji: p.emoji,
                    enabled: p.enabled,
                    bot_user_id: p.bot_user_id,
                    model: p.model,
                },
            })
            .collect())
    }

    /// One health pass: restart dead or stuck agents, then sweep delegation timeouts.
    pub async fn run_health_check(&self) -> Vec<HealthIssue> {
        let snapshots: Vec<_> = self.agents.iter().map(|e| e.value().worker.snapshot()).collect();
        let issues = inspect(&snapshots, self.config.stuck_timeout, Instant::now());

        self.restart_unhealthy(&issues).await;
        self.sweep_timeouts();
        issues
    }

    async fn restart_unhealthy(&self, issues: &[HealthIssue]) {
        for issue in issues {
            // Stopped between snapshot and now.
            if !self.is_running(&issue.agent_id) {
                continue;
            }
            warn!(agent_id = %issue.agent_id, issue = %issue.kind, "restarting unhealthy agent");
            match self.restart_agent(&issue.agent_id).await {
                Ok(_) => {
                    let _ = self.emitter.emit(
                        &issue.agent_id,
                        &RunId::new(),
                        streams::LIFECYCLE,
                        "agent.restarted",
                        json!({ "issue": issue.kind.as_str() }),
                        None,
                    );
                }
                Err(e) => warn!(agent_id = %issue.agent_id, error = %e, "restart failed"),
            }
        }
    }

    fn sweep_timeouts(&self) {
        match self.subagents.check_timeouts() {
            Ok(timed_out) => {
                for run in timed_out {
                    warn!(
                        run_id = %run.run_id,
                        parent = %run.parent_agent_id,
                        child = %run.child_agent_id,
                        "delegation run timed out"
                    );
                    self.emit_run(&run, "run.timed_out");
                }
            }
            Err(e) => warn!(error = %e, "delegation timeout sweep failed"),
        }
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let mut slot = self.health.lock();
        if slot.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        let issues = registry.run_health_check().await;
                        debug!(issues = issues.len(), "health check pass");
                    }
                }
            }
            debug!("health loop exited");
        });
        *slot = Some((cancel, handle));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
