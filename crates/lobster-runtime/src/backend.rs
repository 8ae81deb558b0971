//! Execution backends.
//!
//! An [`ExecutionBackend`] runs one prompt per `ask` call and returns plain
//! text. [`CliBackend`] launches a fresh CLI process in headless `-p` mode for
//! every prompt; `spawn` only records the capability scope.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capabilities::is_wildcard;
use crate::errors::BackendError;

/// Flag carrying the prompt.
pub const PROMPT_FLAG: &str = "-p";
/// Flag restricting the MCP servers the CLI may use.
pub const ALLOWED_MCP_SERVERS_FLAG: &str = "--allowed-mcp-server-names";
/// Flag selecting a model.
pub const MODEL_FLAG: &str = "--model";
/// Model name that needs no flag.
pub const DEFAULT_MODEL: &str = "gemini";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("ansi pattern compiles")
});

/// One agent's connection to the model.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Prepare the backend for the given capability scope.
    async fn spawn(&self, scope: &[String]) -> Result<(), BackendError>;

    /// Run one prompt.
    async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError>;

    /// Aliveness probe used by the health check.
    fn is_alive(&self) -> bool;

    /// Tear down, interrupting any in-flight call.
    async fn kill(&self);
}

/// Remove ANSI escape sequences and surrounding whitespace.
pub fn clean_output(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").trim().to_string()
}

/// Headless CLI backend (`<command> <args…> [--model M] -p <prompt> [--allowed-mcp-server-names …]`).
pub struct CliBackend {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    cwd: Option<PathBuf>,
    scope: Mutex<Vec<String>>,
    ready: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl CliBackend {
    /// Backend invoking `command` with fixed leading `args`.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            model: None,
            cwd: None,
            scope: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Select a model. The default model and blank names add no flag.
    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        let model = model.trim();
        self.model = (!model.is_empty() && model != DEFAULT_MODEL).then(|| model.to_string());
        self
    }

    /// Working directory of spawned processes.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Full argument list for one prompt.
    pub fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(model) = &self.model {
            args.push(MODEL_FLAG.to_string());
            args.push(model.clone());
        }
        args.push(PROMPT_FLAG.to_string());
        args.push(prompt.to_string());
        let scope = self.scope.lock();
        if !scope.is_empty() && !is_wildcard(&scope) {
            args.push(ALLOWED_MCP_SERVERS_FLAG.to_string());
            args.extend(scope.iter().cloned());
        }
        args
    }
}

#[async_trait]
impl ExecutionBackend for CliBackend {
    async fn spawn(&self, scope: &[String]) -> Result<(), BackendError> {
        *self.scope.lock() = scope.to_vec();
        *self.cancel.lock() = CancellationToken::new();
        self.ready.store(true, Ordering::SeqCst);
        debug!(command = %self.command, scope = ?scope, "backend ready");
        Ok(())
    }

    async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        if !self.is_alive() {
            return Err(BackendError::NotReady);
        }
        let start = Instant::now();
        let cancel = self.cancel.lock().clone();

        let mut cmd = tokio::process::Command::new(&self.command);
        let _ = cmd
            .args(self.build_args(prompt))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            let _ = cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        debug!(command = %self.command, pid = ?child.id(), prompt_chars = prompt.len(), "backend process spawned");

        // Dropping the child future kills the process.
        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            () = tokio::time::sleep(timeout) => {
                warn!(command = %self.command, timeout_s = timeout.as_secs_f64(), "backend timed out");
                return Err(BackendError::Timeout(timeout.as_secs_f64()));
            }
            () = cancel.cancelled() => return Err(BackendError::Killed),
        };

        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %self.command, code, duration_ms, "backend exited unsuccessfully");
            return Err(BackendError::NonZeroExit { code, stderr });
        }

        debug!(command = %self.command, duration_ms, stdout_len = output.stdout.len(), "backend completed");
        Ok(clean_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn is_alive(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.cancel.lock().cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn args_with_wildcard_scope() {
        let backend = CliBackend::new("gemini", strings(&["-y"]));
        backend.spawn(&strings(&["*"])).await.unwrap();
        assert_eq!(backend.build_args("hi"), strings(&["-y", "-p", "hi"]));
    }

    #[tokio::test]
    async fn args_with_model_and_scope() {
        let backend = CliBackend::new("gemini", strings(&["-y"])).with_model("flash-2");
        backend.spawn(&strings(&["github", "jira"])).await.unwrap();
        assert_eq!(
            backend.build_args("hi"),
            strings(&["-y", "--model", "flash-2", "-p", "hi", "--allowed-mcp-server-names", "github", "jira"])
        );
    }

    #[test]
    fn default_model_adds_no_flag() {
        let backend = CliBackend::new("gemini", Vec::new()).with_model(" gemini ");
        assert_eq!(backend.build_args("x"), strings(&["-p", "x"]));
    }

    #[test]
    fn ansi_is_stripped() {
        assert_eq!(clean_output("\x1b[1;32mdone\x1b[0m \n\n"), "done");
        assert_eq!(clean_output("  plain  "), "plain");
    }

    #[tokio::test]
    async fn ask_before_spawn_is_rejected() {
        let backend = CliBackend::new("sh", Vec::new());
        assert!(!backend.is_alive());
        assert_matches!(backend.ask("x", Duration::from_secs(1)).await, Err(BackendError::NotReady));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ask_returns_cleaned_stdout() {
        // sh -c SCRIPT sh -p PROMPT  →  $1 = -p, $2 = PROMPT
        let backend = CliBackend::new("sh", strings(&["-c", r#"printf '\033[0m%s\n' "$2""#, "sh"]));
        backend.spawn(&[]).await.unwrap();
        let out = backend.ask("hello world", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let backend = CliBackend::new("sh", strings(&["-c", "echo boom >&2; exit 3", "sh"]));
        backend.spawn(&[]).await.unwrap();
        let err = backend.ask("x", Duration::from_secs(5)).await.unwrap_err();
        assert_matches!(err, BackendError::NonZeroExit { code: 3, ref stderr } if stderr == "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_process_times_out() {
        let backend = CliBackend::new("sh", strings(&["-c", "sleep 5", "sh"]));
        backend.spawn(&[]).await.unwrap();
        let err = backend.ask("x", Duration::from_millis(100)).await.unwrap_err();
        assert_matches!(err, BackendError::Timeout(_));
        assert!(backend.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_interrupts_in_flight_call() {
        let backend = std::sync::Arc::new(CliBackend::new("sh", strings(&["-c", "sleep 5", "sh"])));
        backend.spawn(&[]).await.unwrap();
        let asker = std::sync::Arc::clone(&backend);
        let call = tokio::spawn(async move { asker.ask("x", Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.kill().await;
        assert_matches!(call.await.unwrap(), Err(BackendError::Killed));
        assert!(!backend.is_alive());
    }
}
