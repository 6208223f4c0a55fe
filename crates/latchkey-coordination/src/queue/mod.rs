//! Delayed task queue.
//!
//! Tasks due in the future wait in the sorted set `delayed:` scored by due time.
//! A mover ([`TaskQueue::promote_once`], or the background loop started by
//! [`TaskQueue::spawn_mover`]) takes the earliest entry once it is due and moves it to
//! the tail of its ready list `queue:<name>`, where workers pop it.
//!
//! A promotion holds a short-leased lock named after the task id and moves the entry
//! with one optimistic transaction, so a task reaches its ready list at most once even
//! with several movers running. Ready lists are FIFO by promotion order.

mod mover;

use std::sync::Arc;
use std::time::Duration;

use latchkey_store::Command;
use latchkey_store::KeyValueStore;
use tracing::debug;
use tracing::warn;

pub use self::mover::MoverHandle;
use crate::constants::DEFAULT_MOVER_IDLE_MS;
use crate::constants::DEFAULT_PROMOTE_LEASE_MS;
use crate::constants::DEFAULT_PROMOTE_LOCK_TIMEOUT_MS;
use crate::constants::MAX_MOVER_IDLE_MS;
use crate::error::CoordinationError;
use crate::error::Result;
use crate::id::IdGenerator;
use crate::lock::LockConfig;
use crate::lock::MutexLock;
use crate::pure::keys::DELAYED_KEY;
use crate::pure::keys::queue_key;
use crate::pure::queue::due_at_ms;
use crate::pure::queue::is_due;
use crate::txn::Plan;
use crate::txn::RetryBudget;
use crate::txn::TxnOutcome;
use crate::txn::run_optimistic;
use crate::types::Clock;
use crate::types::SystemClock;
use crate::types::TaskRecord;

/// Queue and mover settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Mover pause when nothing is due. Capped at [`MAX_MOVER_IDLE_MS`].
    pub mover_idle: Duration,
    /// How long a promotion waits for the per-task lock.
    pub promote_lock_timeout: Duration,
    /// Lease on the per-task lock.
    pub promote_lease: Duration,
    /// Conflict budget for moving one entry.
    pub promote_budget: RetryBudget,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mover_idle: Duration::from_millis(DEFAULT_MOVER_IDLE_MS),
            promote_lock_timeout: Duration::from_millis(DEFAULT_PROMOTE_LOCK_TIMEOUT_MS),
            promote_lease: Duration::from_millis(DEFAULT_PROMOTE_LEASE_MS),
            promote_budget: RetryBudget::default(),
        }
    }
}

impl QueueConfig {
    fn idle_pause(&self) -> Duration {
        self.mover_idle.min(Duration::from_millis(MAX_MOVER_IDLE_MS))
    }
}

/// What a single promotion attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Nothing is due.
    Idle,
    /// Another mover holds the lock for the head task.
    Contended { task_id: String },
    /// The head task was appended to its ready list.
    Promoted { task_id: String, queue: String },
    /// The head task was gone by the time the lock was held.
    AlreadyPromoted { task_id: String },
    /// The head entry could not be decoded and was removed.
    Dropped { reason: String },
}

/// Scheduler and mover for delayed tasks.
pub struct TaskQueue<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    lock: MutexLock<S>,
    config: QueueConfig,
}

impl<S: KeyValueStore + ?Sized + 'static> TaskQueue<S> {
    /// Create a queue using the system clock and default settings.
    pub fn new(store: Arc<S>) -> Self {
        let ids = Arc::new(IdGenerator::new());
        let lock = MutexLock::with_config(Arc::clone(&store), Arc::clone(&ids), LockConfig::default());
        Self {
            store,
            ids,
            clock: Arc::new(SystemClock),
            lock,
            config: QueueConfig::default(),
        }
    }

    /// Replace the mover and promotion settings.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for the per-task lock held during promotion.
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock = MutexLock::with_config(Arc::clone(&self.store), Arc::clone(&self.ids), config);
        self
    }

    /// Read due times from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share an identifier generator with other managers.
    pub fn with_ids(mut self, ids: Arc<IdGenerator>) -> Self {
        self.lock = MutexLock::with_config(Arc::clone(&self.store), Arc::clone(&ids), *self.lock.config());
        self.ids = ids;
        self
    }

    /// Current mover and promotion settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Schedule task `name` with `args` on `queue`, due after `delay`.
    ///
    /// A zero delay appends straight to the ready list. Returns the task id.
    pub async fn schedule_later(&self, queue: &str, name: &str, args: &str, delay: Duration) -> Result<String> {
        if queue.is_empty() || name.is_empty() {
            return Err(CoordinationError::InvalidArgument {
                reason: "queue and task name must be non-empty".to_string(),
            });
        }

        let task = TaskRecord {
            id: self.ids.next_id(),
            queue: queue.to_string(),
            name: name.to_string(),
            args: args.to_string(),
        };
        let raw = task.encode()?;

        if delay.is_zero() {
            self.store.execute(Command::rpush(queue_key(queue), raw)).await?;
            debug!(task_id = %task.id, queue, name, "task queued");
        } else {
            let due = due_at_ms(self.clock.now_unix_ms(), delay.as_millis() as u64);
            self.store.execute(Command::zadd(DELAYED_KEY, raw, due as f64)).await?;
            debug!(task_id = %task.id, queue, name, due, "task delayed");
        }
        Ok(task.id)
    }

    /// Schedule a task for immediate delivery.
    pub async fn schedule_now(&self, queue: &str, name: &str, args: &str) -> Result<String> {
        self.schedule_later(queue, name, args, Duration::ZERO).await
    }

    /// Promote the earliest delayed task if it is due.
    pub async fn promote_once(&self) -> Result<PromoteOutcome> {
        let head = self
            .store
            .execute(Command::zrange_with_scores(DELAYED_KEY, 0, 0))
            .await?
            .into_scored_members()?;
        let Some((raw, due)) = head.into_iter().next() else {
            return Ok(PromoteOutcome::Idle);
        };
        if !is_due(due, self.clock.now_unix_ms()) {
            return Ok(PromoteOutcome::Idle);
        }

        let task = match TaskRecord::decode_stored(DELAYED_KEY, &raw) {
            Ok(task) => task,
            Err(e) => {
                self.store.execute(Command::zrem(DELAYED_KEY, raw)).await?;
                warn!(error = %e, "removed undecodable delayed task");
                return Ok(PromoteOutcome::Dropped { reason: e.to_string() });
            }
        };

        let Some(guard) = self
            .lock
            .acquire_with_lease(&task.id, self.config.promote_lock_timeout, self.config.promote_lease)
            .await?
        else {
            debug!(task_id = %task.id, "task lock held by another mover");
            return Ok(PromoteOutcome::Contended { task_id: task.id });
        };

        let moved = self.move_to_ready(&raw, &task.queue).await;
        let released = self.lock.release(&task.id, &guard).await;
        let moved = moved?;
        if !released? {
            warn!(task_id = %task.id, "task lock lease ran out during promotion");
        }

        if moved {
            debug!(task_id = %task.id, queue = %task.queue, "task promoted");
            Ok(PromoteOutcome::Promoted {
                task_id: task.id,
                queue: task.queue,
            })
        } else {
            Ok(PromoteOutcome::AlreadyPromoted { task_id: task.id })
        }
    }

    /// Atomically remove `raw` from `delayed:` and append it to its ready list.
    ///
    /// Returns `false` if the entry is no longer delayed.
    async fn move_to_ready(&self, raw: &str, queue: &str) -> Result<bool> {
        let watched = [DELAYED_KEY.to_string()];
        let ready = queue_key(queue);

        let outcome = run_optimistic(&*self.store, &watched, self.config.promote_budget, "promote task", |session| {
            let raw = raw.to_string();
            let ready = ready.clone();
            Box::pin(async move {
                let score = session.execute(Command::zscore(DELAYED_KEY, raw.as_str())).await?.into_optional_score()?;
                match score {
                    Some(_) => Ok(Plan::Commit(vec![Command::zrem(DELAYED_KEY, raw.as_str()), Command::rpush(ready, raw)])),
                    None => Ok(Plan::Abort(())),
                }
            })
        })
        .await?;

        Ok(matches!(outcome, TxnOutcome::Committed(_)))
    }

    /// Tasks waiting in `delayed:`.
    pub async fn delayed_len(&self) -> Result<u64> {
        let len = self.store.execute(Command::zcard(DELAYED_KEY)).await?.into_integer()?;
        Ok(len.max(0) as u64)
    }

    /// Tasks waiting in the ready list of `queue`.
    pub async fn ready_len(&self, queue: &str) -> Result<u64> {
        let len = self.store.execute(Command::llen(queue_key(queue))).await?.into_integer()?;
        Ok(len.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use latchkey_store::InMemoryStore;
    use tokio::task::JoinSet;

    use super::*;

    async fn ready_tasks(store: &InMemoryStore, queue: &str) -> Vec<TaskRecord> {
        let raw = store.execute(Command::lrange(queue_key(queue), 0, -1)).await.unwrap().into_texts().unwrap();
        raw.iter().map(|r| TaskRecord::decode(r).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_schedule_now_goes_straight_to_ready() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(Arc::clone(&store));

        let id = queue.schedule_now("email", "send", "alice").await.unwrap();
        assert_eq!(queue.delayed_len().await.unwrap(), 0);

        let tasks = ready_tasks(&store, "email").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].name, "send");
        assert_eq!(tasks[0].args, "alice");
    }

    #[test]
    fn test_promotion_lock_settings_survive_shared_ids() {
        let lock_config = LockConfig {
            retry_interval: Duration::from_millis(3),
            ..LockConfig::default()
        };
        let queue = TaskQueue::new(InMemoryStore::new())
            .with_lock_config(lock_config)
            .with_ids(Arc::new(IdGenerator::new()));
        assert_eq!(*queue.lock.config(), lock_config);
    }

    #[tokio::test]
    async fn test_empty_names_rejected() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(store);
        assert!(matches!(
            queue.schedule_now("", "send", "").await,
            Err(CoordinationError::InvalidArgument { .. })
        ));
        assert!(matches!(
            queue.schedule_now("email", "", "").await,
            Err(CoordinationError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_promote_waits_until_due() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(Arc::clone(&store));

        assert_eq!(queue.promote_once().await.unwrap(), PromoteOutcome::Idle);
        let id = queue.schedule_later("email", "send", "", Duration::from_millis(30)).await.unwrap();
        assert_eq!(queue.promote_once().await.unwrap(), PromoteOutcome::Idle);
        assert_eq!(queue.delayed_len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            queue.promote_once().await.unwrap(),
            PromoteOutcome::Promoted {
                task_id: id,
                queue: "email".to_string()
            }
        );
        assert_eq!(queue.delayed_len().await.unwrap(), 0);
        assert_eq!(queue.ready_len("email").await.unwrap(), 1);
        assert_eq!(queue.promote_once().await.unwrap(), PromoteOutcome::Idle);
    }

    #[tokio::test]
    async fn test_promotion_follows_due_order() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(Arc::clone(&store));

        let late = queue.schedule_later("jobs", "late", "", Duration::from_millis(20)).await.unwrap();
        let early = queue.schedule_later("jobs", "early", "", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        while queue.promote_once().await.unwrap() != PromoteOutcome::Idle {}
        let ids: Vec<_> = ready_tasks(&store, "jobs").await.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[tokio::test]
    async fn test_contended_when_task_lock_held() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(Arc::clone(&store));
        let lock = MutexLock::new(Arc::clone(&store));

        let id = queue.schedule_later("email", "send", "", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let held = lock.acquire(&id, Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(
            queue.promote_once().await.unwrap(),
            PromoteOutcome::Contended { task_id: id.clone() }
        );
        assert_eq!(queue.delayed_len().await.unwrap(), 1);

        lock.release(&id, &held).await.unwrap();
        assert!(matches!(queue.promote_once().await.unwrap(), PromoteOutcome::Promoted { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_entry_dropped() {
        let store = InMemoryStore::new();
        let queue = TaskQueue::new(Arc::clone(&store));
        store.execute(Command::zadd(DELAYED_KEY, "not json", 0.0)).await.unwrap();

        match queue.promote_once().await.unwrap() {
            PromoteOutcome::Dropped { reason } => assert!(reason.contains("corrupted data in key 'delayed:'")),
            other => panic!("expected a dropped entry, got {:?}", other),
        }
        assert_eq!(queue.delayed_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_movers_deliver_each_task_once() {
        let store = InMemoryStore::new();
        let scheduler = TaskQueue::new(Arc::clone(&store));
        for i in 0..40 {
            scheduler
                .schedule_later("jobs", "work", &i.to_string(), Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut movers = JoinSet::new();
        for _ in 0..4 {
            let queue = TaskQueue::new(Arc::clone(&store));
            movers.spawn(async move {
                loop {
                    match queue.promote_once().await.unwrap() {
                        PromoteOutcome::Idle => break,
                        _ => tokio::task::yield_now().await,
                    }
                }
            });
        }
        while let Some(result) = movers.join_next().await {
            result.unwrap();
        }

        let mut args: Vec<u32> = ready_tasks(&store, "jobs").await.iter().map(|t| t.args.parse().unwrap()).collect();
        args.sort_unstable();
        assert_eq!(args, (0..40).collect::<Vec<_>>());
    }
}
