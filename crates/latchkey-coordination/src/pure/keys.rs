//! Store key layout.
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `lock:<name>` | string | holder token, optional TTL |
//! | `sem:<name>` | sorted set | token -> acquisition time (Unix ms) |
//! | `sem:<name>:owner` | sorted set | token -> sequence number |
//! | `sem:<name>:counter` | string | last issued sequence number |
//! | `delayed:` | sorted set | serialized task -> due time (Unix ms) |
//! | `queue:<name>` | list | serialized tasks, FIFO |

pub const LOCK_PREFIX: &str = "lock:";
pub const SEMAPHORE_PREFIX: &str = "sem:";
pub const QUEUE_PREFIX: &str = "queue:";
pub const DELAYED_KEY: &str = "delayed:";

/// String key holding a mutex token.
#[inline]
pub fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

/// Sorted set of holders by acquisition time.
#[inline]
pub fn semaphore_key(name: &str) -> String {
    format!("{}{}", SEMAPHORE_PREFIX, name)
}

/// Sorted set of holders by sequence number.
#[inline]
pub fn semaphore_owner_key(name: &str) -> String {
    format!("{}{}:owner", SEMAPHORE_PREFIX, name)
}

#[inline]
pub fn semaphore_counter_key(name: &str) -> String {
    format!("{}{}:counter", SEMAPHORE_PREFIX, name)
}

/// Ready list for queue `name`.
#[inline]
pub fn queue_key(name: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, name)
}

/// Recover the queue name from a ready-queue key.
#[inline]
pub fn queue_name(key: &str) -> Option<&str> {
    key.strip_prefix(QUEUE_PREFIX)
}
