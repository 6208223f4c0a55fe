//! Coordination primitives over a Redis-style key-value store.
//!
//! - [`MutexLock`] - Mutual exclusion with optional leases
//! - [`SemaphoreManager`] - Counting semaphores, plain and fair
//! - [`TaskQueue`] - Delayed tasks promoted into FIFO ready lists by a mover
//! - [`Worker`] - Blocking consumer dispatching tasks to registered handlers
//! - [`IdGenerator`] - Unique, roughly time-ordered tokens and task ids
//!
//! Every primitive works against any [`latchkey_store::KeyValueStore`]. Read-then-write
//! sequences go through [`run_optimistic`], which retries on watch conflicts within a
//! [`RetryBudget`].
//!
//! Timeouts and lost ownership are ordinary results (`Option` / `bool`); only store
//! failures and exhausted retry budgets are errors.
//!
//! ## Lock Example
//!
//! ```ignore
//! use latchkey_coordination::MutexLock;
//!
//! let lock = MutexLock::new(store);
//! if let Some(token) = lock.acquire_with_lease("market", Duration::from_millis(100), Duration::from_secs(10)).await? {
//!     // Protected critical section
//!     lock.release("market", &token).await?;
//! }
//! ```
//!
//! ## Queue Example
//!
//! ```ignore
//! use latchkey_coordination::{HandlerRegistry, TaskQueue, Worker};
//!
//! let queue = Arc::new(TaskQueue::new(store.clone()));
//! let mover = queue.spawn_mover();
//! queue.schedule_later("email", "send", "alice@example.com", Duration::from_secs(5)).await?;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn("send", |task| async move { send_email(&task.args).await });
//! let worker = Arc::new(Worker::new(store, handlers));
//! let handle = worker.spawn(vec!["email".to_string()]);
//! ```

pub mod constants;
mod error;
mod id;
mod lock;
pub mod pure;
mod queue;
mod semaphore;
mod txn;
mod types;
mod worker;

pub use error::CoordinationError;
pub use error::Result;
pub use id::IdGenerator;
pub use lock::LockConfig;
pub use lock::MutexLock;
pub use queue::MoverHandle;
pub use queue::PromoteOutcome;
pub use queue::QueueConfig;
pub use queue::TaskQueue;
pub use semaphore::SemaphoreConfig;
pub use semaphore::SemaphoreManager;
pub use txn::Plan;
pub use txn::RetryBudget;
pub use txn::TxnOutcome;
pub use txn::run_optimistic;
pub use types::Clock;
pub use types::SkewedClock;
pub use types::SystemClock;
pub use types::TaskRecord;
pub use types::Token;
pub use types::now_unix_ms;
pub use worker::HandlerRegistry;
pub use worker::PollOutcome;
pub use worker::TaskHandler;
pub use worker::Worker;
pub use worker::WorkerConfig;
pub use worker::WorkerHandle;
pub use worker::WorkerStats;
pub use worker::WorkerStatsSnapshot;
