//! Per-task delivery signals
//!
//! Lets a blocking `get_task` sleep until the task is delivered or reaches
//! a terminal state instead of polling. Waiters register before re-checking
//! task state, so a wake between check and sleep is never lost.

use pinchwork_types::TaskId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Registry of per-task wakeups. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct TaskSignals {
    inner: Arc<Mutex<HashMap<TaskId, Arc<Notify>>>>,
}

impl TaskSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// The notify handle for a task, created on first use.
    pub fn handle(&self, task_id: &TaskId) -> Arc<Notify> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every waiter on a task.
    pub fn notify(&self, task_id: &TaskId) {
        let handle = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.get(task_id).cloned()
        };
        if let Some(handle) = handle {
            handle.notify_waiters();
        }
    }

    /// Drop a terminal task's handle.
    pub fn cleanup(&self, task_id: &TaskId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_wakes_registered_waiter() {
        let signals = TaskSignals::new();
        let task_id = TaskId::generate();
        let handle = signals.handle(&task_id);

        let notified = handle.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        signals.notify(&task_id);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("waiter should wake");
    }

    #[tokio::test]
    async fn test_notify_unknown_task_is_noop() {
        let signals = TaskSignals::new();
        signals.notify(&TaskId::generate());
        signals.cleanup(&TaskId::generate());
    }
}
