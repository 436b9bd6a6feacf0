use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{signal, sync::broadcast};

/// Why the process is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Graceful,
    /// The signal channel went away without a signal
    Force,
}

impl ShutdownReason {
    /// Exit status reported to the health collaborator.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Force => 1,
        }
    }
}

/// Fans a single OS shutdown signal out to every interested task.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Start shutdown. Only the first call broadcasts.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown initiated");
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::debug!(?reason, "shutdown already initiated, ignoring");
        }
    }

    /// Wait for SIGINT or SIGTERM and broadcast a graceful shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::debug!("signal handler listening for SIGINT and SIGTERM");

        tokio::select! {
            _ = signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = wait_for_sigterm() => tracing::info!("received SIGTERM"),
        }

        self.trigger_shutdown(ShutdownReason::Graceful);
    }

    /// Resolve once shutdown has been broadcast.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if self.is_shutdown_initiated() {
            return ShutdownReason::Graceful;
        }
        receiver.recv().await.unwrap_or(ShutdownReason::Force)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = GracefulShutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(first.try_recv().unwrap(), ShutdownReason::Graceful);
        assert_eq!(second.try_recv().unwrap(), ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn only_first_trigger_is_broadcast() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        shutdown.trigger_shutdown(ShutdownReason::Force);

        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Graceful);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait_for_shutdown_signal().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        assert_eq!(waiter.await.unwrap(), ShutdownReason::Graceful);
        assert_eq!(ShutdownReason::Graceful.exit_code(), 0);
    }
}
