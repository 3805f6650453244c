//! Progress notifications.

use tracing::info;

use crate::stage::Stage;

/// Something worth telling a watcher about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A stage is starting.
    Stage(Stage),
    /// Finished models so far in the current structures stage.
    ModelsDone { done: usize, total: usize },
}

/// Receives progress events. Notification is fire-and-forget.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn notify(&self, _event: ProgressEvent) {}
}

/// Logs every event at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn notify(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Stage(stage) => info!(stage = %stage, "Stage started"),
            ProgressEvent::ModelsDone { done, total } => info!(done, total, "Models finished"),
        }
    }
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn notify(&self, event: ProgressEvent) {
        self(event)
    }
}
