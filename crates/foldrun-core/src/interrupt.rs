//! Cancellation of in-flight cluster runs.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable stop signal.
///
/// Triggering it makes a running cluster fan-out terminate its remote jobs,
/// close its session and fail with `ClusterError::Interrupted`. The signal
/// stays raised until [`InterruptHandle::reset`].
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is raised.
    pub async fn interrupted(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|raised| *raised).await.is_err() {
            // unreachable while `self` holds the sender
            std::future::pending::<()>().await;
        }
    }
}
