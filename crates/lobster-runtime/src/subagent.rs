//! Persistent registry of cross-agent delegation runs.
//!
//! The whole table lives in `<data_dir>/.subagent_runs.json`, keyed by run
//! id, and is rewritten atomically after every mutation under one lock.
//! A missing or corrupt file starts the registry empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lobster_core::RunId;
use lobster_core::fs::atomic_write;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{Result, RuntimeError};

/// File name of the run table.
pub const RUNS_FILE: &str = ".subagent_runs.json";
/// Default delegation timeout.
pub const DEFAULT_DELEGATION_TIMEOUT_S: f64 = 300.0;
/// Error recorded when a failure has no message.
pub const UNKNOWN_FAILURE: &str = "Unknown failure";

/// Status of a delegation run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Recorded, child not yet working.
    #[default]
    Registered,
    /// Child is executing.
    Running,
    /// Child returned a result.
    Completed,
    /// Child failed or could not start.
    Failed,
    /// Swept after exceeding its timeout.
    TimedOut,
}

impl RunStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// One delegation from a parent agent to a child agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubagentRun {
    /// Run id.
    pub run_id: RunId,
    /// Delegating agent.
    pub parent_agent_id: String,
    /// Executing agent.
    pub child_agent_id: String,
    /// Task text.
    pub task: String,
    /// Child session (`delegation-<hex>`).
    pub session_id: String,
    /// Parent's session.
    pub parent_session_id: String,
    /// Current status.
    #[serde(default)]
    pub status: RunStatus,
    /// Child output.
    #[serde(default)]
    pub result: Option<String>,
    /// Failure text.
    #[serde(default)]
    pub error: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Time the run became terminal.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Allowed run time in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_s: f64,
}

fn default_timeout() -> f64 {
    DEFAULT_DELEGATION_TIMEOUT_S
}

impl SubagentRun {
    /// Seconds since registration at `now`.
    #[allow(clippy::cast_precision_loss)]
    pub fn age_at(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

fn required(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RuntimeError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn child_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("delegation-{}", &hex[..8])
}

/// Delegation run table with JSON persistence.
pub struct SubagentRegistry {
    path: PathBuf,
    runs: Mutex<BTreeMap<String, SubagentRun>>,
}

impl SubagentRegistry {
    /// Open the registry stored under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join(RUNS_FILE);
        let runs = load_runs(&path);
        Self {
            path,
            runs: Mutex::new(runs),
        }
    }

    /// Path of the run table.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and record a new run.
    pub fn register_run(
        &self,
        parent_agent_id: &str,
        child_agent_id: &str,
        task: &str,
        parent_session_id: &str,
        timeout_s: f64,
    ) -> Result<SubagentRun> {
        let parent = required(parent_agent_id, "parent_agent_id")?;
        let child = required(child_agent_id, "child_agent_id")?;
        let task = required(task, "task")?;
        let parent_session_id = required(parent_session_id, "parent_session_id")?;
        if !(timeout_s.is_finite() && timeout_s > 0.0) {
            return Err(RuntimeError::Validation("timeout_s must be greater than 0".into()));
        }
        if parent == child {
            return Err(RuntimeError::Validation("Circular delegation is not allowed".into()));
        }

        let run = SubagentRun {
            run_id: RunId::new(),
            parent_agent_id: parent,
            child_agent_id: child,
            task,
            session_id: child_session_id(),
            parent_session_id,
            status: RunStatus::Registered,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            timeout_s,
        };

        let mut runs = self.runs.lock();
        let mut next = runs.clone();
        let _ = next.insert(run.run_id.to_string(), run.clone());
        self.commit(&mut runs, next)?;
        info!(
            run_id = %run.run_id,
            parent = %run.parent_agent_id,
            child = %run.child_agent_id,
            "delegation run registered"
        );
        Ok(run)
    }

    /// `→ Running`. `None` for an unknown id.
    pub fn mark_running(&self, run_id: &str) -> Result<Option<SubagentRun>> {
        self.update(run_id, |run| run.status = RunStatus::Running)
    }

    /// `→ Completed` with `result`. `None` for an unknown id.
    pub fn complete_run(&self, run_id: &str, result: &str) -> Result<Option<SubagentRun>> {
        self.update(run_id, |run| {
            run.status = RunStatus::Completed;
            run.result = Some(result.to_string());
            run.error = None;
            run.completed_at = Some(Utc::now());
        })
    }

    /// `→ Failed` with `error` (blank becomes [`UNKNOWN_FAILURE`]). `None` for an unknown id.
    pub fn fail_run(&self, run_id: &str, error: &str) -> Result<Option<SubagentRun>> {
        let error = match error.trim() {
            "" => UNKNOWN_FAILURE.to_string(),
            e => e.to_string(),
        };
        self.update(run_id, |run| {
            run.status = RunStatus::Failed;
            run.error = Some(error);
            run.completed_at = Some(Utc::now());
        })
    }

    /// Time out every running run older than its own timeout.
    pub fn check_timeouts(&self) -> Result<Vec<SubagentRun>> {
        self.check_timeouts_at(Utc::now())
    }

    /// [`check_timeouts`](Self::check_timeouts) evaluated at `now`.
    ///
    /// Each run is returned once; timed-out runs are no longer `Running`.
    pub fn check_timeouts_at(&self, now: DateTime<Utc>) -> Result<Vec<SubagentRun>> {
        let mut runs = self.runs.lock();
        let mut next = runs.clone();
        let mut timed_out = Vec::new();
        for run in next.values_mut() {
            if run.status != RunStatus::Running || run.age_at(now) <= run.timeout_s {
                continue;
            }
            run.status = RunStatus::TimedOut;
            run.error = Some(format!("Timed out after {:.1}s", run.timeout_s));
            run.completed_at = Some(now);
            timed_out.push(run.clone());
        }
        if !timed_out.is_empty() {
            self.commit(&mut runs, next)?;
        }
        Ok(timed_out)
    }

    /// Run by id.
    pub fn get_run(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.lock().get(run_id).cloned()
    }

    /// Runs, optionally only those of one parent, newest first.
    pub fn list_runs(&self, parent_agent_id: Option<&str>) -> Vec<SubagentRun> {
        let parent = parent_agent_id.map(str::trim).filter(|p| !p.is_empty());
        let mut runs: Vec<SubagentRun> = self
            .runs
            .lock()
            .values()
            .filter(|r| parent.is_none_or(|p| r.parent_agent_id == p))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    fn update(&self, run_id: &str, apply: impl FnOnce(&mut SubagentRun)) -> Result<Option<SubagentRun>> {
        let mut runs = self.runs.lock();
        let Some(mut updated) = runs.get(run_id).cloned() else {
            return Ok(None);
        };
        apply(&mut updated);
        let mut next = runs.clone();
        let _ = next.insert(run_id.to_string(), updated.clone());
        self.commit(&mut runs, next)?;
        Ok(Some(updated))
    }

    /// Persist `next`, then make it the live table. A failed write leaves
    /// the live table untouched.
    fn commit(&self, live: &mut BTreeMap<String, SubagentRun>, next: BTreeMap<String, SubagentRun>) -> Result<()> {
        self.persist(&next)?;
        *live = next;
        Ok(())
    }

    fn persist(&self, runs: &BTreeMap<String, SubagentRun>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut json = serde_json::to_string_pretty(runs)?;
        json.push('\n');
        atomic_write(&self.path, json.as_bytes())?;
        Ok(())
    }
}

fn load_runs(path: &Path) -> BTreeMap<String, SubagentRun> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read delegation runs, starting fresh");
            return BTreeMap::new();
        }
    };
    let table = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(table)) => table,
        Ok(_) => {
            warn!(path = %path.display(), "delegation run file is not a JSON object, starting fresh");
            return BTreeMap::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to decode delegation runs, starting fresh");
            return BTreeMap::new();
        }
    };

    let mut runs = BTreeMap::new();
    for (key, value) in table {
        match serde_json::from_value::<SubagentRun>(value) {
            Ok(run) => {
                let _ = runs.insert(run.run_id.to_string(), run);
            }
            Err(e) => warn!(run_id = %key, error = %e, "skipping invalid delegation run record"),
        }
    }
    runs
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use tempfile::TempDir;

    fn register(reg: &SubagentRegistry, parent: &str, timeout_s: f64) -> SubagentRun {
        reg.register_run(parent, "child", "do X", "s1", timeout_s).unwrap()
    }

    #[test]
    fn register_assigns_ids_and_persists() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let run = register(&reg, "parent", 30.0);
        assert_eq!(run.status, RunStatus::Registered);
        assert!(run.session_id.starts_with("delegation-"));
        assert_eq!(run.session_id.len(), "delegation-".len() + 8);

        let reopened = SubagentRegistry::new(dir.path());
        assert_eq!(reopened.get_run(&run.run_id).unwrap(), run);
    }

    #[test]
    fn self_delegation_is_rejected_without_persisting() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let err = reg.register_run("a", " a ", "t", "s", 10.0).unwrap_err();
        assert_eq!(err.to_string(), "Circular delegation is not allowed");
        assert!(reg.list_runs(None).is_empty());
        assert!(!reg.path().exists());
    }

    #[test]
    fn field_validation() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        assert_eq!(reg.register_run(" ", "b", "t", "s", 1.0).unwrap_err().to_string(), "parent_agent_id is required");
        assert_eq!(reg.register_run("a", "b", "", "s", 1.0).unwrap_err().to_string(), "task is required");
        assert_eq!(reg.register_run("a", "b", "t", "", 1.0).unwrap_err().to_string(), "parent_session_id is required");
        for bad in [0.0, -1.0, f64::NAN] {
            assert_eq!(
                reg.register_run("a", "b", "t", "s", bad).unwrap_err().to_string(),
                "timeout_s must be greater than 0"
            );
        }
    }

    #[test]
    fn transitions() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let run = register(&reg, "p", 30.0);

        let running = reg.mark_running(&run.run_id).unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        let done = reg.complete_run(&run.run_id, "ok").unwrap().unwrap();
        assert_eq!((done.status, done.result.as_deref()), (RunStatus::Completed, Some("ok")));
        assert!(done.completed_at.is_some());

        let other = register(&reg, "p", 30.0);
        let failed = reg.fail_run(&other.run_id, "  ").unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some(UNKNOWN_FAILURE));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        assert!(reg.mark_running("nope").unwrap().is_none());
        assert!(reg.complete_run("nope", "x").unwrap().is_none());
        assert!(reg.fail_run("nope", "x").unwrap().is_none());
        assert!(reg.get_run("nope").is_none());
    }

    #[test]
    fn timeout_sweep_reports_each_run_once() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let slow = register(&reg, "p", 10.0);
        let fresh = register(&reg, "p", 100.0);
        let idle = register(&reg, "p", 10.0);
        let _ = reg.mark_running(&slow.run_id).unwrap();
        let _ = reg.mark_running(&fresh.run_id).unwrap();

        let later = slow.created_at + Duration::seconds(11);
        let swept = reg.check_timeouts_at(later).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].run_id, slow.run_id);
        assert_eq!(swept[0].status, RunStatus::TimedOut);
        assert_eq!(swept[0].error.as_deref(), Some("Timed out after 10.0s"));

        assert!(reg.check_timeouts_at(later).unwrap().is_empty());
        assert_eq!(reg.get_run(&idle.run_id).unwrap().status, RunStatus::Registered);
        assert_eq!(reg.get_run(&fresh.run_id).unwrap().status, RunStatus::Running);
    }

    #[test]
    fn failed_write_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let kept = register(&reg, "p", 10.0);
        let _ = reg.mark_running(&kept.run_id).unwrap();

        std::fs::remove_file(reg.path()).unwrap();
        std::fs::create_dir(reg.path()).unwrap();

        assert!(reg.register_run("a", "b", "t", "s", 10.0).is_err());
        assert_eq!(reg.list_runs(None).len(), 1);

        assert!(reg.complete_run(&kept.run_id, "late").is_err());
        assert_eq!(reg.get_run(&kept.run_id).unwrap().status, RunStatus::Running);

        let later = kept.created_at + Duration::seconds(11);
        assert!(reg.check_timeouts_at(later).is_err());
        assert_eq!(reg.get_run(&kept.run_id).unwrap().status, RunStatus::Running);
    }

    #[test]
    fn list_is_newest_first_and_filters_parent() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let first = register(&reg, "p1", 30.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = register(&reg, "p2", 30.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = register(&reg, "p1", 30.0);

        let all: Vec<RunId> = reg.list_runs(None).into_iter().map(|r| r.run_id).collect();
        assert_eq!(all, vec![third.run_id.clone(), second.run_id, first.run_id.clone()]);
        let p1: Vec<RunId> = reg.list_runs(Some("p1")).into_iter().map(|r| r.run_id).collect();
        assert_eq!(p1, vec![third.run_id, first.run_id]);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(RUNS_FILE), "{not json").unwrap();
        assert!(SubagentRegistry::new(dir.path()).list_runs(None).is_empty());

        std::fs::write(dir.path().join(RUNS_FILE), "[1, 2]").unwrap();
        assert!(SubagentRegistry::new(dir.path()).list_runs(None).is_empty());
    }

    #[test]
    fn invalid_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let reg = SubagentRegistry::new(dir.path());
        let run = register(&reg, "p", 30.0);
        let mut table: serde_json::Map<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(reg.path()).unwrap()).unwrap();
        let _ = table.insert("junk".into(), serde_json::json!({"status": "running"}));
        std::fs::write(reg.path(), serde_json::to_string(&table).unwrap()).unwrap();

        let reopened = SubagentRegistry::new(dir.path());
        assert_eq!(reopened.list_runs(None).len(), 1);
        assert_matches!(reopened.get_run(&run.run_id), Some(SubagentRun { status: RunStatus::Registered, .. }));
    }
}
