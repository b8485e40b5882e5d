//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal cancels the cycle token: workers stop taking new transfer tasks,
//! in-flight uploads finish, and the cycle ends without committing a baseline
//! unless every task had already succeeded.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Turns process signals into cooperative cancellation.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel without a signal, e.g. when the cycle already finished.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    ///
    /// Returns early if the token is cancelled by other means.
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
                warn!("Received SIGINT (Ctrl+C), finishing in-flight transfers before stopping...");
            }
            _ = terminate => {
                warn!("Received SIGTERM, finishing in-flight transfers before stopping...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
        info!("Cancellation requested");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
