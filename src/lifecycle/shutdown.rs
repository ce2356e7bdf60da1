//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

use super::signals::shutdown_signal;

/// Owns the root cancellation token of the process.
///
/// Every runner receives a child of this token; triggering it starts the
/// graceful shutdown of all of them.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger on SIGINT/SIGTERM. A second signal exits immediately.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = this.token.cancelled() => return,
            }
            this.trigger();
            shutdown_signal().await;
            tracing::warn!("Second shutdown signal received; exiting immediately");
            std::process::exit(130);
        })
    }
}
