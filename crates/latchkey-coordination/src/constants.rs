//! Limits and defaults for coordination primitives.
//!
//! # Tiger Style
//!
//! Every loop in this crate is bounded by one of these values or by a caller deadline.

use std::time::Duration;

/// Floor applied to lock acquisition timeouts.
///
/// Shorter timeouts would turn acquisition into a single racy attempt.
pub const MIN_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 10;

/// Pause between set-if-absent attempts while waiting for a lock.
pub const LOCK_RETRY_INTERVAL_MS: u64 = 1;

/// Attempts allowed for one optimistic transaction before giving up.
pub const MAX_TXN_ATTEMPTS: u32 = 100;

/// Identifiers issued per second before borrowing the next second.
pub const IDS_PER_SECOND: u64 = 10_000;

/// Default idle pause for the mover when no delayed task is due.
pub const DEFAULT_MOVER_IDLE_MS: u64 = 10;

/// Upper bound on the mover idle pause.
pub const MAX_MOVER_IDLE_MS: u64 = 1_000;

/// Default lease on the per-task promotion lock.
pub const DEFAULT_PROMOTE_LEASE_MS: u64 = 10_000;

/// Default time to wait for the per-task promotion lock.
pub const DEFAULT_PROMOTE_LOCK_TIMEOUT_MS: u64 = 10;

/// Default time a guarded semaphore acquisition waits for its guard lock.
pub const DEFAULT_GUARD_LOCK_TIMEOUT_MS: u64 = 1_000;

/// Default lease on a semaphore guard lock.
pub const DEFAULT_GUARD_LOCK_LEASE_MS: u64 = 10_000;

/// Default blocking-pop timeout for workers.
///
/// Shutdown is only observed between pops, so this also bounds how long a worker
/// takes to stop.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum number of ready queues a single worker may watch.
pub const MAX_WORKER_QUEUES: usize = 64;
