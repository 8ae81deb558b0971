//! Hand-written fakes shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lobster_events::EventEmitter;
use lobster_memory::{ChunkSummarizer, ContextBuilder, MemoryConfig, MemoryManager, MessageEntry};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::backend::ExecutionBackend;
use crate::capabilities::CapabilityResolver;
use crate::errors::BackendError;
use crate::persona::Persona;
use crate::worker::{AgentWorker, Worker, WorkerFactory};

/// Summarizer that always answers with one bullet.
pub struct StaticSummarizer;

#[async_trait]
impl ChunkSummarizer for StaticSummarizer {
    async fn summarize(&self, _chunk: &[MessageEntry]) -> lobster_memory::Result<String> {
        Ok("- summary".to_string())
    }
}

/// Context builder over a fresh memory at `<dir>/agents/<id>`.
pub fn context_for(dir: &TempDir, id: &str) -> Arc<ContextBuilder> {
    let memory = MemoryManager::new(
        dir.path().join("agents").join(id),
        MemoryConfig::default(),
        Arc::new(StaticSummarizer),
    )
    .unwrap();
    Arc::new(ContextBuilder::new(Arc::new(memory)))
}

/// Instrumented backend replying `done: <last prompt line>`.
pub struct FakeBackend {
    alive: AtomicBool,
    delay: Duration,
    failure: Option<String>,
    dies_after_ask: bool,
    scope: Mutex<Vec<String>>,
    /// `(start, end)` of every `ask`.
    pub calls: Mutex<Vec<(Instant, Instant)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(false),
            delay: Duration::ZERO,
            failure: None,
            dies_after_ask: false,
            scope: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, stderr: &str) -> Self {
        self.failure = Some(stderr.to_string());
        self
    }

    pub fn dying(mut self) -> Self {
        self.dies_after_ask = true;
        self
    }

    pub fn scope(&self) -> Vec<String> {
        self.scope.lock().clone()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn spawn(&self, scope: &[String]) -> Result<(), BackendError> {
        *self.scope.lock() = scope.to_vec();
        self.set_alive(true);
        Ok(())
    }

    async fn ask(&self, prompt: &str, _timeout: Duration) -> Result<String, BackendError> {
        if !self.is_alive() {
            return Err(BackendError::NotReady);
        }
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.calls.lock().push((start, Instant::now()));
        if self.dies_after_ask {
            self.set_alive(false);
        }
        if let Some(stderr) = &self.failure {
            return Err(BackendError::NonZeroExit {
                code: 1,
                stderr: stderr.clone(),
            });
        }
        let last = prompt.trim().lines().last().unwrap_or_default();
        Ok(format!("done: {last}"))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.set_alive(false);
    }
}

/// Factory wiring [`AgentWorker`]s to [`FakeBackend`]s and keeping every backend it made.
pub struct FakeFactory {
    emitter: Arc<EventEmitter>,
    delay: Duration,
    pub created: AtomicUsize,
    pub backends: Mutex<Vec<(String, Arc<FakeBackend>)>>,
}

impl FakeFactory {
    pub fn new(emitter: Arc<EventEmitter>, delay: Duration) -> Self {
        Self {
            emitter,
            delay,
            created: AtomicUsize::new(0),
            backends: Mutex::new(Vec::new()),
        }
    }

    /// Newest backend built for `agent_id`.
    pub fn backend_for(&self, agent_id: &str) -> Option<Arc<FakeBackend>> {
        self.backends
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == agent_id)
            .map(|(_, b)| Arc::clone(b))
    }
}

impl WorkerFactory for FakeFactory {
    fn create(&self, persona: &Persona, context: Arc<ContextBuilder>) -> Arc<dyn Worker> {
        let backend = Arc::new(FakeBackend::new().with_delay(self.delay));
        self.backends.lock().push((persona.id.clone(), Arc::clone(&backend)));
        let _ = self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(AgentWorker::new(
            persona.id.clone(),
            backend,
            Arc::new(CapabilityResolver::default()),
            context,
            Arc::clone(&self.emitter),
        ))
    }
}
