//! Task model: a unit of work assigned to one agent.
//!
//! A task is created by a caller, mutated only by the agent executing it, and
//! frozen once it reaches a terminal status. Every transition is appended to
//! the task's event log with a timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::TaskId;

/// Default per-task timeout in seconds.
pub const DEFAULT_TASK_TIMEOUT_S: f64 = 120.0;

/// Priority bands for queued work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// User-visible work.
    High,
    /// Must run next.
    Critical,
}

impl TaskPriority {
    /// Numeric weight of the band.
    pub fn value(self) -> i64 {
        match self {
            Self::Low => 30,
            Self::Normal => 50,
            Self::High => 70,
            Self::Critical => 90,
        }
    }

    /// Map a raw numeric priority onto the highest band it reaches.
    pub fn from_value(value: i64) -> Self {
        if value >= 90 {
            Self::Critical
        } else if value >= 70 {
            Self::High
        } else if value >= 50 {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

/// Task lifecycle status.
///
/// `Pending → Running → {Completed | Failed | Canceled}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet picked up.
    #[default]
    Pending,
    /// An agent is executing it.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Abandoned before completion.
    Canceled,
}

impl TaskStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// One entry of a task's lifecycle log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Transition kind (`created`, `running`, `completed`, ...).
    pub kind: String,
    /// Structured detail.
    #[serde(default)]
    pub payload: Value,
}

/// A unit of work for one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// Prompt text sent to the agent.
    pub prompt: String,
    /// Session the exchange is recorded under.
    pub session_id: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Backend timeout in seconds.
    pub timeout_s: f64,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Output text once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error text once failed or canceled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the task became terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Ordered lifecycle log.
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl Task {
    /// Create a pending task with default priority and timeout.
    pub fn new(prompt: impl Into<String>, session_id: impl Into<String>) -> Self {
        let mut task = Self {
            id: TaskId::new(),
            prompt: prompt.into(),
            session_id: session_id.into(),
            priority: TaskPriority::Normal,
            timeout_s: DEFAULT_TASK_TIMEOUT_S,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            events: Vec::new(),
        };
        task.add_event("created", Value::Null);
        task
    }

    /// Set the backend timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    /// Set the priority band.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Append an event to the lifecycle log.
    pub fn add_event(&mut self, kind: &str, payload: Value) {
        self.events.push(TaskEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            payload,
        });
    }

    /// `Pending → Running`.
    pub fn mark_running(&mut self, agent_id: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Running;
        self.add_event("running", json!({ "agent_id": agent_id }));
    }

    /// Finish with a result.
    pub fn complete(&mut self, result: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let result = result.into();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.add_event("completed", json!({ "chars": result.chars().count() }));
        self.result = Some(result);
    }

    /// Finish with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let error = error.into();
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.add_event("failed", json!({ "error": error }));
        self.error = Some(error);
    }

    /// Abandon the task.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let reason = reason.into();
        self.status = TaskStatus::Canceled;
        self.completed_at = Some(Utc::now());
        self.add_event("canceled", json!({ "reason": reason }));
        self.error = Some(reason);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
