//! Graceful process shutdown.
//!
//! Waits for ctrl-c or for the node to ask for an exit (RPC `stop`, a
//! scheduled shutdown), then cancels every registered task and joins them
//! with a bounded wait.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Clone of the token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Blocks until ctrl-c or `requested` fires, then shuts the tasks down.
    pub async fn wait_for_shutdown(self, requested: CancellationToken) {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = requested.cancelled() => tracing::info!("🛑 Shutdown requested"),
        }
        self.shutdown().await;
    }

    /// Cancels the token and joins every registered task.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("task ended abnormally: {}", e);
                }
            }
        };

        match tokio::time::timeout(JOIN_TIMEOUT, join_all).await {
            Ok(()) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requested_shutdown_cancels_tasks() {
        let mut manager = ShutdownManager::new();
        let token = manager.token();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
        }));

        let requested = CancellationToken::new();
        requested.cancel();
        tokio::time::timeout(Duration::from_secs(5), manager.wait_for_shutdown(requested))
            .await
            .unwrap();
    }
}
