//! The event emitter.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use lobster_core::EventId;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::history;
use crate::types::AgentEvent;

/// Default size of the recent-events ring.
pub const DEFAULT_MAX_RECENT: usize = 500;

const BROADCAST_CAPACITY: usize = 1024;

/// Synchronous event listener.
pub type EventListener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

type ListenerTable = RwLock<Vec<(u64, EventListener)>>;

struct EmitterState {
    seqs: HashMap<String, u64>,
    recent: VecDeque<AgentEvent>,
}

/// Process-wide agent event bus.
pub struct EventEmitter {
    state: Mutex<EmitterState>,
    max_recent: usize,
    listeners: Arc<ListenerTable>,
    next_listener_id: AtomicU64,
    events_dir: Option<PathBuf>,
    tx: broadcast::Sender<AgentEvent>,
}

impl EventEmitter {
    /// Create an emitter. When `events_dir` is set, each event is appended
    /// to `<events_dir>/<agent_id>/events.jsonl`.
    pub fn new(events_dir: Option<PathBuf>, max_recent: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(EmitterState {
                seqs: HashMap::new(),
                recent: VecDeque::new(),
            }),
            max_recent: max_recent.max(1),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            events_dir,
            tx,
        }
    }

    /// Emitter with no disk persistence.
    pub fn in_memory() -> Self {
        Self::new(None, DEFAULT_MAX_RECENT)
    }

    /// Directory events are persisted under, if any.
    pub fn events_dir(&self) -> Option<&Path> {
        self.events_dir.as_deref()
    }

    /// Emit one event and return it.
    ///
    /// Listener panics and persistence failures are logged and swallowed.
    pub fn emit(
        &self,
        agent_id: &str,
        run_id: &str,
        stream: &str,
        event_type: &str,
        data: Value,
        session_id: Option<&str>,
    ) -> AgentEvent {
        let event = {
            let mut state = self.state.lock();
            let seq = state.seqs.entry(run_id.to_string()).or_insert(0);
            *seq += 1;
            let event = AgentEvent {
                event_id: EventId::new(),
                run_id: run_id.to_string(),
                agent_id: agent_id.to_string(),
                seq: *seq,
                stream: stream.to_string(),
                event_type: event_type.to_string(),
                timestamp: Utc::now(),
                data,
                session_id: session_id.map(str::to_string),
            };
            state.recent.push_back(event.clone());
            while state.recent.len() > self.max_recent {
                let _ = state.recent.pop_front();
            }
            event
        };

        self.notify(&event);
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
        self.persist(&event);
        debug!(agent_id, run_id, stream, event_type, seq = event.seq, "event emitted");
        event
    }

    /// Register a synchronous listener.
    pub fn on_event(&self, listener: EventListener) -> Unsubscribe {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Unsubscribe {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Subscribe to the live feed.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Most recent events, optionally filtered by agent and stream.
    ///
    /// Filters first, then keeps the newest `limit` (at least one) in
    /// emission order.
    pub fn recent_events(
        &self,
        agent_id: Option<&str>,
        stream: Option<&str>,
        limit: usize,
    ) -> Vec<AgentEvent> {
        let limit = limit.max(1);
        let state = self.state.lock();
        let matching: Vec<&AgentEvent> = state
            .recent
            .iter()
            .filter(|e| agent_id.is_none_or(|a| e.agent_id == a))
            .filter(|e| stream.is_none_or(|s| e.stream == s))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Newest `limit` persisted events for one agent.
    pub fn read_history(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentEvent>> {
        history::validate_agent_id(agent_id)?;
        match &self.events_dir {
            Some(dir) => history::read_tail(&history::events_path(dir, agent_id), limit),
            None => Ok(Vec::new()),
        }
    }

    fn notify(&self, event: &AgentEvent) {
        let listeners: Vec<EventListener> =
            self.listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    agent_id = %event.agent_id,
                    event_type = %event.event_type,
                    "event listener panicked"
                );
            }
        }
    }

    fn persist(&self, event: &AgentEvent) {
        let Some(dir) = &self.events_dir else {
            return;
        };
        if history::validate_agent_id(&event.agent_id).is_err() {
            warn!(agent_id = %event.agent_id, "refusing to persist event for unsafe agent id");
            return;
        }
        let path = history::events_path(dir, &event.agent_id);
        if let Err(error) = append_line(&path, event) {
            warn!(path = %path.display(), %error, "failed to persist event");
        }
    }
}

fn append_line(path: &Path, event: &AgentEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

/// Handle returned by [`EventEmitter::on_event`].
pub struct Unsubscribe {
    listeners: Weak<ListenerTable>,
    id: u64,
}

impl Unsubscribe {
    /// Remove the listener. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut table = listeners.write();
        let before = table.len();
        table.retain(|(id, _)| *id != self.id);
        table.len() != before
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EventsError;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn emit_simple(emitter: &EventEmitter, agent: &str, run: &str, stream: &str) -> AgentEvent {
        emitter.emit(agent, run, stream, "tick", json!({}), None)
    }

    #[test]
    fn seq_is_scoped_per_run() {
        let emitter = EventEmitter::in_memory();
        assert_eq!(emit_simple(&emitter, "a", "r1", "memory").seq, 1);
        assert_eq!(emit_simple(&emitter, "a", "r1", "memory").seq, 2);
        assert_eq!(emit_simple(&emitter, "a", "r2", "memory").seq, 1);
        assert_eq!(emit_simple(&emitter, "b", "r1", "memory").seq, 3);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let emitter = EventEmitter::new(None, 3);
        for _ in 0..5 {
            let _ = emit_simple(&emitter, "a", "r", "lifecycle");
        }
        let recent = emitter.recent_events(None, None, 100);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].seq, 3);
        assert_eq!(recent[2].seq, 5);
    }

    #[test]
    fn recent_events_filters_then_limits() {
        let emitter = EventEmitter::in_memory();
        let _ = emit_simple(&emitter, "a", "r", "memory");
        let _ = emit_simple(&emitter, "b", "r", "memory");
        let _ = emit_simple(&emitter, "a", "r", "lifecycle");
        let _ = emit_simple(&emitter, "a", "r", "memory");

        let a_memory = emitter.recent_events(Some("a"), Some("memory"), 10);
        assert_eq!(a_memory.len(), 2);
        assert!(a_memory.iter().all(|e| e.agent_id == "a" && e.stream == "memory"));

        let newest = emitter.recent_events(Some("a"), None, 1);
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].seq, 4);

        // zero limit is treated as one
        assert_eq!(emitter.recent_events(None, None, 0).len(), 1);
    }

    #[test]
    fn listeners_receive_and_unsubscribe() {
        let emitter = EventEmitter::in_memory();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = emitter.on_event(Arc::new(move |_e: &AgentEvent| {
            let _ = seen.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = emit_simple(&emitter, "a", "r", "memory");
        assert!(handle.unsubscribe());
        let _ = emit_simple(&emitter, "a", "r", "memory");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_propagate() {
        let emitter = EventEmitter::in_memory();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let _bad = emitter.on_event(Arc::new(|_e: &AgentEvent| panic!("listener bug")));
        let _good = emitter.on_event(Arc::new(move |_e: &AgentEvent| {
            let _ = seen.fetch_add(1, Ordering::SeqCst);
        }));

        let event = emit_simple(&emitter, "a", "r", "memory");
        assert_eq!(event.seq, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_subscribers_get_live_events() {
        let emitter = EventEmitter::in_memory();
        let mut rx = emitter.subscribe();
        let sent = emitter.emit("a", "r", "delegation", "run.started", json!({"x": 1}), Some("s1"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn persisted_history_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = EventEmitter::new(Some(dir.path().to_path_buf()), 10);
        for _ in 0..4 {
            let _ = emit_simple(&emitter, "alpha", "r", "memory");
        }
        let _ = emit_simple(&emitter, "beta", "r", "memory");

        let history = emitter.read_history("alpha", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 3);
        assert_eq!(history[1].seq, 4);
        assert!(dir.path().join("beta").join("events.jsonl").exists());
    }

    #[test]
    fn history_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = EventEmitter::new(Some(dir.path().to_path_buf()), 10);
        assert_matches!(
            emitter.read_history("../etc", 10),
            Err(EventsError::InvalidAgentId(_))
        );
    }

    #[test]
    fn history_without_dir_is_empty() {
        let emitter = EventEmitter::in_memory();
        assert!(emitter.read_history("alpha", 10).unwrap().is_empty());
    }
}
