use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One `(total, current, id, error)` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub current: usize,
    /// Object key being processed, or the output path on the final event.
    pub id: String,
    pub error: Option<String>,
}

impl Progress {
    pub fn ok(total: usize, current: usize, id: impl Into<String>) -> Self {
        Self {
            total,
            current,
            id: id.into(),
            error: None,
        }
    }

    pub fn failed(total: usize, current: usize, id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            total,
            current,
            id: id.into(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Caller-supplied progress callback.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Callback that drops every event.
pub fn noop() -> ProgressFn {
    Arc::new(|_| {})
}

/// Callback forwarding events into an unbounded channel.
pub fn channel() -> (ProgressFn, mpsc::UnboundedReceiver<Progress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ProgressFn = Arc::new(move |event| {
        // Receiver gone means nobody is listening any more.
        let _ = tx.send(event);
    });
    (callback, rx)
}
