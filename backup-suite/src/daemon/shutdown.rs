//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! Running backups are cancelled and given a grace period to remove their
//! partial directories before the process exits.

use crate::engine::Engine;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How long cancelled runs get to clean up
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, grace }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.notify();
    }

    /// Broadcast shutdown to every subscriber
    pub fn notify(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Cancel running backups and wait for them to clean up
    pub async fn shutdown(&self, engine: &Engine) {
        info!("Graceful shutdown initiated");
        engine.shutdown(self.grace).await;
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Collaborators;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::default();
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.notify();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_idle_engine_is_immediate() {
        let engine = Engine::new(Config::default(), Collaborators::host(&Config::default()));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        let started = std::time::Instant::now();
        coordinator.shutdown(&engine).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!engine.has_running());
    }
}
