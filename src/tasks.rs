use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-lived task paired with its cancellation token. Shutdown is
/// cooperative: cancel, then join, so the task finishes its cleanup before
/// the coordinator moves on.
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &'static str, cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            cancel,
            handle: tokio::spawn(future),
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            error!(task = self.name, error = %err, "Task terminated abnormally");
        }
    }
}

/// Block until SIGINT, SIGTERM, or an internal fatal error. The fatal token
/// is cancelled by any listener that cannot carry on; cancelling a token is
/// idempotent, so concurrent failures cannot start a signal storm.
pub async fn shutdown_signal(fatal: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "Failed to install SIGTERM handler");
            fatal.cancelled().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = sigterm.recv() => info!("Terminated"),
        _ = fatal.cancelled() => error!("Internal fatal error, shutting down"),
    }
}
