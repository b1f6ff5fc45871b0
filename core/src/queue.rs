//! Task queue port: the core only needs `enqueue`/`revoke` plus a way to
//! observe "this task has been soft-cancelled" from inside the Runner's poll
//! loop. Grounded in `lumberjack/apps/jobs/tasks.py` (Celery task
//! definitions) and `apps/jobs/managers.py` (enqueue/revoke call sites);
//! `SoftTimeLimitExceeded` has no Rust analogue, so it's modelled as an
//! explicit cancellation flag per the REDESIGN FLAGS note on soft time
//! limits.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// Cooperative cancellation signal delivered into a Runner's poll loop,
/// standing in for the queue runtime raising `SoftTimeLimitExceeded` inside
/// the task's execution context.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled; used by the Runner's poll
    /// loop via `tokio::select!` alongside its 1s tick.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct TaskHandle {
    cancel_tx: watch::Sender<bool>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Registers a new background task under `task_id` (the Output's
    /// `background_task_id`) and returns the `CancellationToken` the
    /// corresponding Runner should poll.
    async fn enqueue(&self, task_id: Uuid, queue: &str, args: Value) -> CancellationToken;

    /// Soft-terminates the task: the Runner sees its `CancellationToken`
    /// flip on its next check. A no-op if the task is unknown (already
    /// finished or never registered).
    async fn revoke(&self, task_id: Uuid);
}

/// Single-process stand-in for the distributed broker, sufficient to drive
/// the Runner's cancellation path in tests and the CLI harness.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<HashMap<Uuid, TaskHandle>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task_id: Uuid, queue: &str, _args: Value) -> CancellationToken {
        tracing::debug!(%task_id, queue, "enqueued rendition task");
        let (tx, rx) = watch::channel(false);
        self.tasks.lock().await.insert(task_id, TaskHandle { cancel_tx: tx });
        CancellationToken { rx }
    }

    async fn revoke(&self, task_id: Uuid) {
        if let Some(handle) = self.tasks.lock().await.remove(&task_id) {
            let _ = handle.cancel_tx.send(true);
        }
    }
}

pub type SharedTaskQueue = Arc<dyn TaskQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoke_flips_the_token_the_runner_is_watching() {
        let queue = InMemoryTaskQueue::new();
        let task_id = Uuid::new_v4();
        let mut token = queue.enqueue(task_id, "default", Value::Null).await;
        assert!(!token.is_cancelled());

        queue.revoke(task_id).await;
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn revoking_unknown_task_is_a_no_op() {
        let queue = InMemoryTaskQueue::new();
        queue.revoke(Uuid::new_v4()).await;
    }
}
