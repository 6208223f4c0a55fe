//! Fair semaphore: admission by request order instead of client clocks.

use std::time::Duration;

use latchkey_store::Aggregate;
use latchkey_store::Command;
use latchkey_store::KeyValueStore;
use latchkey_store::ScoreBound;
use tracing::debug;
use tracing::warn;

use super::SemaphoreManager;
use super::reply_at;
use crate::error::Result;
use crate::pure::keys::semaphore_counter_key;
use crate::pure::keys::semaphore_key;
use crate::pure::keys::semaphore_owner_key;
use crate::pure::semaphore::expiry_cutoff_ms;
use crate::pure::semaphore::is_admitted;
use crate::types::Token;

impl<S: KeyValueStore + ?Sized + 'static> SemaphoreManager<S> {
    /// Try to take one of `limit` slots of the fair semaphore `name`.
    ///
    /// Each attempt draws a sequence number from `sem:<name>:counter` and is ranked by
    /// it in `sem:<name>:owner`. Timestamps are still recorded in `sem:<name>` and only
    /// decide which holders have timed out.
    pub async fn acquire_fair(&self, name: &str, limit: u32, timeout: Duration) -> Result<Option<Token>> {
        let key = semaphore_key(name);
        let owner = semaphore_owner_key(name);
        let counter = semaphore_counter_key(name);
        let token = self.ids.next_token();
        let now = self.clock.now_unix_ms();
        let cutoff = expiry_cutoff_ms(now, timeout.as_millis() as u64);

        // Sweep timed-out holders and drop their owner entries by intersecting with
        // the slot set at weight zero.
        let replies = self
            .store
            .execute_batch(vec![
                Command::zrem_range_by_score(&key, ScoreBound::NegInfinity, ScoreBound::Inclusive(cutoff as f64)),
                Command::ZInterStore {
                    destination: owner.clone(),
                    sources: vec![(owner.clone(), 1.0), (key.clone(), 0.0)],
                    aggregate: Aggregate::Sum,
                },
                Command::incr(&counter),
            ])
            .await?;
        let sequence = reply_at(replies, 2)?.into_integer()?;

        let replies = self
            .store
            .execute_batch(vec![
                Command::zadd(&key, token.as_str(), now as f64),
                Command::zadd(&owner, token.as_str(), sequence as f64),
                Command::zrank(&owner, token.as_str()),
            ])
            .await?;
        let rank = reply_at(replies, 2)?.into_optional_integer()?;

        if rank.is_some_and(|r| is_admitted(r as u64, limit as u64)) {
            debug!(name, token = %token, sequence, rank, limit, "fair semaphore acquired");
            return Ok(Some(token));
        }

        self.store
            .execute_batch(vec![Command::zrem(&key, token.as_str()), Command::zrem(&owner, token.as_str())])
            .await?;
        debug!(name, sequence, rank, limit, "fair semaphore full");
        Ok(None)
    }

    /// Give back a fair semaphore slot.
    ///
    /// Returns `false` if the token had already timed out of the slot set.
    pub async fn release_fair(&self, name: &str, token: &Token) -> Result<bool> {
        let replies = self
            .store
            .execute_batch(vec![
                Command::zrem(semaphore_key(name), token.as_str()),
                Command::zrem(semaphore_owner_key(name), token.as_str()),
            ])
            .await?;
        let removed = reply_at(replies, 0)?.into_integer()? > 0;
        debug!(name, token = %token, removed, "fair semaphore released");
        Ok(removed)
    }

    /// Extend a fair semaphore hold by stamping it with the current time.
    ///
    /// Returns `false` if the hold had already timed out; the stale stamp and owner
    /// entry are removed again and the caller must re-acquire.
    pub async fn refresh_fair(&self, name: &str, token: &Token) -> Result<bool> {
        let now = self.clock.now_unix_ms();
        let added = self
            .store
            .execute(Command::zadd(semaphore_key(name), token.as_str(), now as f64))
            .await?
            .into_integer()?;

        if added > 0 {
            self.release_fair(name, token).await?;
            debug!(name, token = %token, "refresh found an expired hold");
            return Ok(false);
        }
        debug!(name, token = %token, "fair semaphore refreshed");
        Ok(true)
    }

    /// [`SemaphoreManager::acquire_fair`] serialized behind the lock named `name`.
    ///
    /// Returns `None` without attempting the semaphore if the guard lock cannot be
    /// taken within the configured guard timeout. The guard is released whatever
    /// the acquisition result.
    pub async fn acquire_fair_guarded(&self, name: &str, limit: u32, timeout: Duration) -> Result<Option<Token>> {
        let Some(guard) = self
            .lock
            .acquire_with_lease(name, self.config.guard_timeout, self.config.guard_lease)
            .await?
        else {
            debug!(name, "semaphore guard lock busy");
            return Ok(None);
        };

        let acquired = self.acquire_fair(name, limit, timeout).await;
        let released = self.lock.release(name, &guard).await;

        if let Ok(false) = released {
            warn!(name, "semaphore guard lock expired before release");
        }
        let token = acquired?;
        released?;
        Ok(token)
    }
}
