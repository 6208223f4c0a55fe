//! Mutual-exclusion lock over a single string key.
//!
//! A lock named `n` is held while `lock:n` exists; its value is the holder's token.
//! Acquisition is a set-if-absent retried every [`LOCK_RETRY_INTERVAL_MS`] until the
//! acquire timeout runs out. Release deletes the key only if it still holds the
//! caller's token, checked through the optimistic transaction runner.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use latchkey_store::Command;
use latchkey_store::KeyTtl;
use latchkey_store::KeyValueStore;
use tracing::debug;

use crate::constants::LOCK_RETRY_INTERVAL_MS;
use crate::error::CoordinationError;
use crate::error::Result;
use crate::id::IdGenerator;
use crate::pure::keys::lock_key;
use crate::pure::lock::effective_acquire_timeout_ms;
use crate::txn::Plan;
use crate::txn::RetryBudget;
use crate::txn::TxnOutcome;
use crate::txn::run_optimistic;
use crate::types::Token;

/// Lock behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Pause between acquisition attempts.
    pub retry_interval: Duration,
    /// Conflict budget for release.
    pub release_budget: RetryBudget,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(LOCK_RETRY_INTERVAL_MS),
            release_budget: RetryBudget::default(),
        }
    }
}

/// Mutex lock manager.
///
/// One manager serves any number of lock names.
pub struct MutexLock<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    ids: Arc<IdGenerator>,
    config: LockConfig,
}

impl<S: KeyValueStore + ?Sized> Clone for MutexLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ids: Arc::clone(&self.ids),
            config: self.config,
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> MutexLock<S> {
    /// Create a lock manager with default settings.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, Arc::new(IdGenerator::new()), LockConfig::default())
    }

    /// Create a lock manager drawing tokens from `ids`.
    pub fn with_config(store: Arc<S>, ids: Arc<IdGenerator>, config: LockConfig) -> Self {
        Self { store, ids, config }
    }

    /// Timing settings used for every acquire.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `name`, waiting up to `acquire_timeout`.
    ///
    /// Returns `None` if the lock is still held when the timeout elapses. The timeout
    /// is raised to [`crate::constants::MIN_LOCK_ACQUIRE_TIMEOUT_MS`] if lower. The
    /// lock never expires on its own; see [`MutexLock::acquire_with_lease`].
    pub async fn acquire(&self, name: &str, acquire_timeout: Duration) -> Result<Option<Token>> {
        self.acquire_inner(name, acquire_timeout, None).await
    }

    /// Acquire `name` with a lease so that a crashed holder cannot keep it forever.
    ///
    /// While waiting, a lock found without any expiry gets `lease` installed on it.
    pub async fn acquire_with_lease(&self, name: &str, acquire_timeout: Duration, lease: Duration) -> Result<Option<Token>> {
        if lease.is_zero() {
            return Err(CoordinationError::InvalidArgument {
                reason: "lock lease must be non-zero".to_string(),
            });
        }
        self.acquire_inner(name, acquire_timeout, Some(lease)).await
    }

    async fn acquire_inner(&self, name: &str, acquire_timeout: Duration, lease: Option<Duration>) -> Result<Option<Token>> {
        let key = lock_key(name);
        let token = self.ids.next_token();
        let timeout_ms = effective_acquire_timeout_ms(acquire_timeout.as_millis() as u64);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let acquired = self.store.execute(Command::set_nx(&key, token.as_str(), lease)).await?.into_bool()?;
            if acquired {
                debug!(name, token = %token, lease_ms = lease.map(|l| l.as_millis() as u64), "lock acquired");
                return Ok(Some(token));
            }

            if let Some(lease) = lease {
                self.install_missing_lease(&key, lease).await?;
            }

            if Instant::now() >= deadline {
                debug!(name, timeout_ms, "lock acquisition timed out");
                return Ok(None);
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Put an expiry on `key` if it exists without one.
    ///
    /// Single attempt; a conflict means the key changed and the next acquisition
    /// round sees the new state.
    async fn install_missing_lease(&self, key: &str, lease: Duration) -> Result<()> {
        let watched = [key.to_string()];
        let outcome = run_optimistic(&*self.store, &watched, RetryBudget::Attempts(1), "lock lease", |session| {
            let key = key.to_string();
            Box::pin(async move {
                match session.execute(Command::pttl(&key)).await?.into_ttl()? {
                    KeyTtl::Persistent => Ok(Plan::Commit(vec![Command::pexpire(key, lease)])),
                    _ => Ok(Plan::Abort(())),
                }
            })
        })
        .await;

        match outcome {
            Ok(TxnOutcome::Committed(_)) => {
                debug!(key, lease_ms = lease.as_millis() as u64, "installed lease on lock without expiry");
                Ok(())
            }
            Ok(TxnOutcome::Aborted(())) | Err(CoordinationError::RetriesExhausted { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release `name` if `token` still holds it.
    ///
    /// Returns `false` when the lock expired or now belongs to someone else. That is
    /// an expected outcome with leases, not an error.
    pub async fn release(&self, name: &str, token: &Token) -> Result<bool> {
        let key = lock_key(name);
        let watched = [key.clone()];
        let expected = token.as_str().to_string();

        let outcome = run_optimistic(&*self.store, &watched, self.config.release_budget, "lock release", |session| {
            let key = key.clone();
            let expected = expected.clone();
            Box::pin(async move {
                let current = session.execute(Command::get(&key)).await?.into_optional_text()?;
                if current.as_deref() == Some(expected.as_str()) {
                    Ok(Plan::Commit(vec![Command::del(key)]))
                } else {
                    Ok(Plan::Abort(current))
                }
            })
        })
        .await?;

        match outcome {
            TxnOutcome::Committed(_) => {
                debug!(name, token = %token, "lock released");
                Ok(true)
            }
            TxnOutcome::Aborted(current) => {
                debug!(name, token = %token, current = ?current, "lock already lost");
                Ok(false)
            }
        }
    }

    /// Current holder of `name`, if any.
    pub async fn holder(&self, name: &str) -> Result<Option<Token>> {
        let value = self.store.execute(Command::get(lock_key(name))).await?.into_optional_text()?;
        Ok(value.map(Token::from))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use latchkey_store::InMemoryStore;
    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        let token = lock.acquire("market", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lock.holder("market").await.unwrap(), Some(token.clone()));
        assert!(lock.release("market", &token).await.unwrap());
        assert_eq!(lock.holder("market").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        let _held = lock.acquire("market", Duration::from_millis(50)).await.unwrap().unwrap();
        let started = Instant::now();
        let second = lock.acquire("market", Duration::from_millis(30)).await.unwrap();
        assert!(second.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_timeout_floor() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        let _held = lock.acquire("market", Duration::ZERO).await.unwrap().unwrap();
        let started = Instant::now();
        assert!(lock.acquire("market", Duration::ZERO).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(crate::constants::MIN_LOCK_ACQUIRE_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_is_lost() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        let token = lock.acquire("market", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(!lock.release("market", &Token::from("someone-else")).await.unwrap());
        assert_eq!(lock.holder("market").await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_release_after_takeover_reports_lost() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        let first = lock
            .acquire_with_lease("market", Duration::from_millis(50), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = lock.acquire("market", Duration::from_millis(50)).await.unwrap().unwrap();

        assert!(!lock.release("market", &first).await.unwrap());
        assert!(lock.release("market", &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_expiry_frees_lock() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);

        // Holder "crashes" without releasing.
        lock.acquire_with_lease("job", Duration::from_millis(50), Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.acquire("job", Duration::from_millis(10)).await.unwrap().is_none());

        let taken = lock.acquire("job", Duration::from_millis(200)).await.unwrap();
        assert!(taken.is_some());
    }

    #[tokio::test]
    async fn test_lease_installed_on_lock_without_expiry() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(Arc::clone(&store));

        lock.acquire("job", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(store.execute(Command::pttl("lock:job")).await.unwrap().into_ttl().unwrap(), KeyTtl::Persistent);

        let waited = lock
            .acquire_with_lease("job", Duration::from_millis(10), Duration::from_millis(40))
            .await
            .unwrap();
        assert!(waited.is_none());
        assert!(matches!(
            store.execute(Command::pttl("lock:job")).await.unwrap().into_ttl().unwrap(),
            KeyTtl::Expires(_)
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lock.acquire("job", Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_lease_rejected() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);
        let result = lock.acquire_with_lease("job", Duration::from_millis(10), Duration::ZERO).await;
        assert!(matches!(result, Err(CoordinationError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let store = InMemoryStore::new();
        let lock = MutexLock::new(store);
        let inside = Arc::new(AtomicU32::new(0));
        let completed = Arc::new(AtomicU32::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            let completed = Arc::clone(&completed);
            tasks.spawn(async move {
                let token = lock.acquire("shared", Duration::from_secs(5)).await.unwrap().unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders inside");
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                assert!(lock.release("shared", &token).await.unwrap());
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }
}
