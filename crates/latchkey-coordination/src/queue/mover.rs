//! Background mover loop.

use std::sync::Arc;

use latchkey_store::KeyValueStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::PromoteOutcome;
use super::TaskQueue;

impl<S: KeyValueStore + ?Sized + 'static> TaskQueue<S> {
    /// Promote due tasks until `cancel` fires. Returns the number promoted.
    ///
    /// Store errors are logged and retried after the idle pause.
    pub async fn run_mover(&self, cancel: &CancellationToken) -> u64 {
        let idle = self.config.idle_pause();
        let mut promoted: u64 = 0;
        info!(idle_ms = idle.as_millis() as u64, "delayed task mover started");

        while !cancel.is_cancelled() {
            let pause = match self.promote_once().await {
                Ok(PromoteOutcome::Promoted { .. }) => {
                    promoted += 1;
                    false
                }
                Ok(PromoteOutcome::AlreadyPromoted { task_id }) => {
                    debug!(task_id = %task_id, "task promoted by another mover");
                    false
                }
                Ok(PromoteOutcome::Dropped { .. }) => false,
                Ok(PromoteOutcome::Idle) | Ok(PromoteOutcome::Contended { .. }) => true,
                Err(e) => {
                    warn!(error = %e, "promotion failed");
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }

        info!(promoted, "delayed task mover stopped");
        promoted
    }
}

impl<S: KeyValueStore + ?Sized + 'static> TaskQueue<S> {
    /// Run the mover on a background task.
    pub fn spawn_mover(self: &Arc<Self>) -> MoverHandle {
        let cancel = CancellationToken::new();
        let queue = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { queue.run_mover(&token).await });
        MoverHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Handle for a running mover.
///
/// Dropping the handle signals the mover to stop.
pub struct MoverHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl MoverHandle {
    /// True until the mover loop has ended.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the mover and wait for it. Returns the number of tasks it promoted.
    pub async fn stop(mut self) -> u64 {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for MoverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use latchkey_store::InMemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_spawned_mover_promotes_and_stops() {
        let store = InMemoryStore::new();
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store)));
        let handle = queue.spawn_mover();
        assert!(handle.is_running());

        for i in 0..3 {
            queue
                .schedule_later("jobs", "work", &i.to_string(), Duration::from_millis(10))
                .await
                .unwrap();
        }

        let started = Instant::now();
        while queue.ready_len("jobs").await.unwrap() < 3 {
            assert!(started.elapsed() < Duration::from_secs(5), "mover did not promote");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handle.stop().await, 3);
        assert_eq!(queue.delayed_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_mover_returns_promptly() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.run_mover(&cancel).await, 0);
    }
}
