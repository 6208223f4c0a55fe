//! Worker dispatch loop.
//!
//! A worker blocks on one or more ready lists, pops one task per wake and hands it to
//! the handler registered under the task's name. Lists are served in the order given:
//! when several hold tasks, the first one wins.
//!
//! A popped task is gone from the store. If the handler fails, or the worker dies
//! while it runs, the task is not redelivered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_store::Command;
use latchkey_store::KeyValueStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::DEFAULT_BLOCK_TIMEOUT;
use crate::constants::MAX_WORKER_QUEUES;
use crate::error::CoordinationError;
use crate::error::Result;
use crate::pure::keys::queue_key;
use crate::pure::keys::queue_name;
use crate::types::TaskRecord;

/// Handles tasks of one name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        (self.0)(task.clone()).await
    }
}

/// Task name to handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for tasks named `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    /// Handler registered for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.names()).finish()
    }
}

/// Worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long one blocking pop waits for a task.
    pub block_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

/// Running totals for a worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    dispatched: AtomicU64,
    failed: AtomicU64,
    unknown: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Tasks whose handler returned success.
    pub dispatched: u64,
    /// Tasks whose handler returned an error.
    pub failed: u64,
    /// Tasks with no registered handler.
    pub unknown: u64,
    /// Entries that did not decode as a task.
    pub malformed: u64,
}

impl WorkerStats {
    /// Read all counters. Each is loaded separately, so the copy is not atomic as a whole.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Result of one pop-and-dispatch round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No task arrived within the block timeout.
    Empty,
    Dispatched { task_id: String, name: String },
    Failed { task_id: String, name: String, error: String },
    /// No handler is registered for the task name; the task was dropped.
    UnknownHandler { task_id: String, name: String },
    /// The popped entry was not a task; it was dropped.
    Malformed { queue: String, reason: String },
}

/// Consumer of ready lists.
pub struct Worker<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl<S: KeyValueStore + ?Sized + 'static> Worker<S> {
    /// Create a worker with default settings.
    pub fn new(store: Arc<S>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config: WorkerConfig::default(),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Replace the worker settings.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Counters shared with every handle spawned from this worker.
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Handlers this worker dispatches to.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Wait for one task on `queues` and dispatch it.
    pub async fn poll_once<Q: AsRef<str> + Sync>(&self, queues: &[Q]) -> Result<PollOutcome> {
        if queues.is_empty() || queues.len() > MAX_WORKER_QUEUES {
            return Err(CoordinationError::InvalidArgument {
                reason: format!("worker needs between 1 and {} queues, got {}", MAX_WORKER_QUEUES, queues.len()),
            });
        }
        if self.config.block_timeout.is_zero() {
            return Err(CoordinationError::InvalidArgument {
                reason: "worker block timeout must be non-zero".to_string(),
            });
        }

        let keys: Vec<String> = queues.iter().map(|q| queue_key(q.as_ref())).collect();
        let popped = self
            .store
            .execute(Command::blpop(keys, self.config.block_timeout))
            .await?
            .into_popped()?;
        let Some((key, raw)) = popped else {
            return Ok(PollOutcome::Empty);
        };
        let queue = queue_name(&key).unwrap_or(&key).to_string();

        let task = match TaskRecord::decode_stored(&key, &raw) {
            Ok(task) => task,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %queue, error = %e, "dropped malformed task");
                return Ok(PollOutcome::Malformed {
                    queue,
                    reason: e.to_string(),
                });
            }
        };

        let Some(handler) = self.registry.get(&task.name) else {
            self.stats.unknown.fetch_add(1, Ordering::Relaxed);
            warn!(queue = %queue, task_id = %task.id, name = %task.name, "no handler for task, dropped");
            return Ok(PollOutcome::UnknownHandler {
                task_id: task.id,
                name: task.name,
            });
        };

        match handler.handle(&task).await {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %queue, task_id = %task.id, name = %task.name, "task handled");
                Ok(PollOutcome::Dispatched {
                    task_id: task.id,
                    name: task.name,
                })
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %queue, task_id = %task.id, name = %task.name, error = %e, "task handler failed");
                Ok(PollOutcome::Failed {
                    task_id: task.id,
                    name: task.name,
                    error: format!("{:#}", e),
                })
            }
        }
    }

    /// Dispatch tasks from `queues` until `cancel` fires.
    ///
    /// Cancellation is checked between pops, so stopping can take up to one block
    /// timeout. Store errors end the loop.
    pub async fn drain<Q: AsRef<str> + Sync>(&self, queues: &[Q], cancel: &CancellationToken) -> Result<()> {
        info!(queues = queues.len(), handlers = self.registry.len(), "worker started");
        while !cancel.is_cancelled() {
            self.poll_once(queues).await?;
        }
        let stats = self.stats.snapshot();
        info!(
            dispatched = stats.dispatched,
            failed = stats.failed,
            unknown = stats.unknown,
            malformed = stats.malformed,
            "worker stopped"
        );
        Ok(())
    }

    /// Run [`Worker::drain`] on a background task.
    pub fn spawn(self: &Arc<Self>, queues: Vec<String>) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let worker = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { worker.drain(&queues[..], &token).await });
        WorkerHandle {
            cancel,
            stats: Arc::clone(&self.stats),
            task: Some(task),
        }
    }
}

/// Handle for a running worker.
///
/// Dropping the handle signals the worker to stop after its current pop.
pub struct WorkerHandle {
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
    task: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    /// Counters so far. The worker keeps running.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// True until the loop has ended, by [`WorkerHandle::stop`] or by a store error.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the loop to end without asking it to stop.
    ///
    /// The loop only ends on its own when the store fails; that error is returned
    /// here. Safe to use in `select!`: dropping the future leaves the worker running.
    pub async fn finished(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(()),
        }
    }

    /// Stop the worker and wait for its loop to end.
    pub async fn stop(mut self) -> Result<WorkerStatsSnapshot> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        Ok(self.stats.snapshot())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
