//! Counting semaphores over sorted sets.
//!
//! Holders live in the slot set `sem:<name>` scored by acquisition time. A holder is
//! inside the semaphore while its rank among the members is below the limit; members
//! older than the holder timeout are swept before every rank check.
//!
//! Two variants are offered:
//!
//! - **Plain** ([`SemaphoreManager::acquire`]): ranks by timestamp. One atomic batch,
//!   no retries. Clients whose clocks run slow rank ahead of everyone else, and two
//!   clients can both see a free slot in the same round, so the limit is approximate.
//! - **Fair** ([`SemaphoreManager::acquire_fair`]): ranks by a per-semaphore sequence
//!   counter kept in `sem:<name>:owner`, so admission follows request order regardless
//!   of clock skew. [`SemaphoreManager::acquire_fair_guarded`] additionally serializes
//!   acquirers with a short-lived lock to close the remaining window between the
//!   owner-set cleanup and the rank check.

mod fair;

use std::sync::Arc;
use std::time::Duration;

use latchkey_store::Command;
use latchkey_store::KeyValueStore;
use latchkey_store::Reply;
use latchkey_store::ScoreBound;
use latchkey_store::StoreError;
use tracing::debug;

use crate::constants::DEFAULT_GUARD_LOCK_LEASE_MS;
use crate::constants::DEFAULT_GUARD_LOCK_TIMEOUT_MS;
use crate::error::Result;
use crate::id::IdGenerator;
use crate::lock::LockConfig;
use crate::lock::MutexLock;
use crate::pure::keys::semaphore_key;
use crate::pure::semaphore::expiry_cutoff_ms;
use crate::pure::semaphore::is_admitted;
use crate::types::Clock;
use crate::types::SystemClock;
use crate::types::Token;

/// Semaphore behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreConfig {
    /// How long a guarded acquisition waits for the guard lock.
    pub guard_timeout: Duration,
    /// Lease on the guard lock, bounding how long a crashed acquirer can block others.
    pub guard_lease: Duration,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            guard_timeout: Duration::from_millis(DEFAULT_GUARD_LOCK_TIMEOUT_MS),
            guard_lease: Duration::from_millis(DEFAULT_GUARD_LOCK_LEASE_MS),
        }
    }
}

/// Manager for plain and fair semaphores.
pub struct SemaphoreManager<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    lock: MutexLock<S>,
    config: SemaphoreConfig,
}

impl<S: KeyValueStore + ?Sized + 'static> SemaphoreManager<S> {
    /// Create a semaphore manager using the system clock.
    pub fn new(store: Arc<S>) -> Self {
        let ids = Arc::new(IdGenerator::new());
        let lock = MutexLock::with_config(Arc::clone(&store), Arc::clone(&ids), LockConfig::default());
        Self {
            store,
            ids,
            clock: Arc::new(SystemClock),
            lock,
            config: SemaphoreConfig::default(),
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the guard settings.
    pub fn with_config(mut self, config: SemaphoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for the guard lock taken by [`SemaphoreManager::acquire_fair_guarded`].
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock = MutexLock::with_config(Arc::clone(&self.store), Arc::clone(&self.ids), config);
        self
    }

    /// Share an identifier generator with other managers.
    pub fn with_ids(mut self, ids: Arc<IdGenerator>) -> Self {
        self.lock = MutexLock::with_config(Arc::clone(&self.store), Arc::clone(&ids), *self.lock.config());
        self.ids = ids;
        self
    }

    /// Try to take one of `limit` slots of the plain semaphore `name`.
    ///
    /// Holders older than `timeout` are considered dead and swept first. Returns
    /// `None` when all slots are taken; the attempt leaves nothing behind.
    pub async fn acquire(&self, name: &str, limit: u32, timeout: Duration) -> Result<Option<Token>> {
        let key = semaphore_key(name);
        let token = self.ids.next_token();
        let now = self.clock.now_unix_ms();
        let cutoff = expiry_cutoff_ms(now, timeout.as_millis() as u64);

        let replies = self
            .store
            .execute_batch(vec![
                Command::zrem_range_by_score(&key, ScoreBound::NegInfinity, ScoreBound::Inclusive(cutoff as f64)),
                Command::zadd(&key, token.as_str(), now as f64),
                Command::zrank(&key, token.as_str()),
            ])
            .await?;
        let rank = reply_at(replies, 2)?.into_optional_integer()?;

        if rank.is_some_and(|r| is_admitted(r as u64, limit as u64)) {
            debug!(name, token = %token, rank, limit, "semaphore acquired");
            return Ok(Some(token));
        }

        self.store.execute(Command::zrem(&key, token.as_str())).await?;
        debug!(name, rank, limit, "semaphore full");
        Ok(None)
    }

    /// Give back a plain semaphore slot.
    ///
    /// Returns `false` if the token was no longer present, i.e. it had timed out and
    /// been swept.
    pub async fn release(&self, name: &str, token: &Token) -> Result<bool> {
        let removed = self
            .store
            .execute(Command::zrem(semaphore_key(name), token.as_str()))
            .await?
            .into_integer()?;
        debug!(name, token = %token, removed = removed > 0, "semaphore released");
        Ok(removed > 0)
    }

    /// Number of holders stamped within the last `timeout`.
    ///
    /// Expired entries that no acquisition has swept yet are not counted.
    pub async fn holder_count(&self, name: &str, timeout: Duration) -> Result<u64> {
        let cutoff = expiry_cutoff_ms(self.clock.now_unix_ms(), timeout.as_millis() as u64);
        let live = self
            .store
            .execute(Command::ZRangeByScore {
                key: semaphore_key(name),
                min: ScoreBound::Exclusive(cutoff as f64),
                max: ScoreBound::PosInfinity,
                with_scores: false,
            })
            .await?
            .into_texts()?;
        Ok(live.len() as u64)
    }
}

/// Take the reply at `index` out of a batch result.
pub(crate) fn reply_at(replies: Vec<Reply>, index: usize) -> std::result::Result<Reply, StoreError> {
    let len = replies.len();
    replies.into_iter().nth(index).ok_or_else(|| StoreError::Protocol {
        reason: format!("batch returned {} replies, wanted index {}", len, index),
    })
}

#[cfg(test)]
mod tests {
    use latchkey_store::InMemoryStore;

    use super::*;
    use crate::types::SkewedClock;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_plain_acquire_up_to_limit() {
        let store = InMemoryStore::new();
        let sem = SemaphoreManager::new(store);

        let a = sem.acquire("db", 2, TIMEOUT).await.unwrap();
        let b = sem.acquire("db", 2, TIMEOUT).await.unwrap();
        let c = sem.acquire("db", 2, TIMEOUT).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
        assert_eq!(sem.holder_count("db", TIMEOUT).await.unwrap(), 2);

        assert!(sem.release("db", &a.unwrap()).await.unwrap());
        assert!(sem.acquire("db", 2, TIMEOUT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_plain_release_unknown_token() {
        let store = InMemoryStore::new();
        let sem = SemaphoreManager::new(store);
        assert!(!sem.release("db", &Token::from("nobody")).await.unwrap());
    }

    #[tokio::test]
    async fn test_plain_expired_holders_are_swept() {
        let store = InMemoryStore::new();
        let sem = SemaphoreManager::new(store);
        let timeout = Duration::from_millis(30);

        let stale = sem.acquire("db", 1, timeout).await.unwrap().unwrap();
        assert!(sem.acquire("db", 1, timeout).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sem.acquire("db", 1, timeout).await.unwrap().is_some());
        assert!(!sem.release("db", &stale).await.unwrap());
    }

    #[test]
    fn test_guard_lock_settings_survive_shared_ids() {
        let lock_config = LockConfig {
            retry_interval: Duration::from_millis(7),
            ..LockConfig::default()
        };
        let sem = SemaphoreManager::new(InMemoryStore::new())
            .with_lock_config(lock_config)
            .with_ids(Arc::new(IdGenerator::new()));
        assert_eq!(*sem.lock.config(), lock_config);
    }

    #[tokio::test]
    async fn test_holder_count_skips_expired_entries() {
        let store = InMemoryStore::new();
        let sem = SemaphoreManager::new(Arc::clone(&store));
        let later = SemaphoreManager::new(Arc::clone(&store)).with_clock(Arc::new(SkewedClock::new(60_000)));

        sem.acquire("db", 2, TIMEOUT).await.unwrap().unwrap();
        assert_eq!(sem.holder_count("db", TIMEOUT).await.unwrap(), 1);
        assert_eq!(later.holder_count("db", TIMEOUT).await.unwrap(), 0);
        // Counting does not sweep.
        let card = store.execute(Command::zcard(semaphore_key("db"))).await.unwrap();
        assert_eq!(card, Reply::Integer(1));
    }

    #[tokio::test]
    async fn test_plain_semaphore_is_unfair_under_skew() {
        let store = InMemoryStore::new();
        let on_time = SemaphoreManager::new(Arc::clone(&store));
        let slow = SemaphoreManager::new(Arc::clone(&store)).with_clock(Arc::new(SkewedClock::new(-2_000)));

        let first = on_time.acquire("db", 1, TIMEOUT).await.unwrap();
        assert!(first.is_some());
        // The slow clock ranks the later request ahead of the earlier holder.
        let second = slow.acquire("db", 1, TIMEOUT).await.unwrap();
        assert!(second.is_some());
    }
}
