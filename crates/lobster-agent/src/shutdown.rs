//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time allowed for background tasks to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fans one shutdown signal out to every long-running task.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Resolve on Ctrl-C or on an explicit [`shutdown`](Self::shutdown).
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "could not listen for ctrl-c");
                }
                info!("ctrl-c received");
                self.shutdown();
            }
            () = self.token.cancelled() => {}
        }
    }

    /// Cancel the token and wait up to `timeout` for `handles` to finish.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(task_count = handles.len(), timeout_secs = timeout.as_secs(), "waiting for tasks to complete");

        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        assert!(!ShutdownCoordinator::new().token().is_cancelled());
    }

    #[tokio::test]
    async fn explicit_shutdown_releases_waiters() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.shutdown();
        coord.wait_for_signal().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });
        coord.drain(vec![handle], Some(Duration::from_secs(1))).await;
        assert!(coord.token().is_cancelled());
    }
}
