//! Optimistic transaction runner.
//!
//! Every read-then-write sequence in this crate goes through [`run_optimistic`]:
//! watch the keys, let a transition read and decide, commit its write batch, and on a
//! watch conflict start over with fresh reads. Writes only ever happen in the
//! committed batch, so an attempt that is discarded leaves no trace.

use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use latchkey_store::Command;
use latchkey_store::KeyValueStore;
use latchkey_store::Reply;
use latchkey_store::StoreError;
use latchkey_store::WatchSession;
use tracing::debug;

use crate::constants::MAX_TXN_ATTEMPTS;
use crate::error::CoordinationError;
use crate::error::Result;

/// How long a transaction may keep retrying on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// At most this many attempts.
    Attempts(u32),
    /// Keep retrying until this much time has passed. At least one attempt is made.
    Deadline(Duration),
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::Attempts(MAX_TXN_ATTEMPTS)
    }
}

impl RetryBudget {
    fn allows(&self, attempts_made: u32, started: Instant) -> bool {
        match *self {
            RetryBudget::Attempts(max) => attempts_made < max.max(1),
            RetryBudget::Deadline(limit) => attempts_made == 0 || started.elapsed() < limit,
        }
    }
}

/// What a transition decided after reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan<A> {
    /// Commit these writes if nothing watched has changed.
    Commit(Vec<Command>),
    /// Stop without writing. Never retried.
    Abort(A),
}

/// Result of a transaction that did not exhaust its budget.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome<A> {
    /// The batch was applied; replies in command order.
    Committed(Vec<Reply>),
    /// The transition aborted with this reason.
    Aborted(A),
}

/// Run an optimistic transaction.
///
/// `transition` is called once per attempt with a fresh watch session on `watched`.
/// It must not write through the session; everything it wants written goes into
/// [`Plan::Commit`]. Store errors end the loop immediately. Running out of budget is
/// [`CoordinationError::RetriesExhausted`], distinct from [`TxnOutcome::Aborted`].
pub async fn run_optimistic<S, A, F>(
    store: &S,
    watched: &[String],
    budget: RetryBudget,
    operation: &str,
    mut transition: F,
) -> Result<TxnOutcome<A>>
where
    S: KeyValueStore + ?Sized,
    F: for<'s> FnMut(&'s mut dyn WatchSession) -> BoxFuture<'s, Result<Plan<A>, StoreError>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    while budget.allows(attempts, started) {
        attempts += 1;
        let mut session = store.watch(watched.to_vec()).await?;

        let plan = match transition(session.as_mut()).await {
            Ok(plan) => plan,
            Err(err) => {
                let _ = session.discard().await;
                return Err(err.into());
            }
        };

        match plan {
            Plan::Abort(reason) => {
                session.discard().await?;
                return Ok(TxnOutcome::Aborted(reason));
            }
            Plan::Commit(commands) => match session.commit(commands).await? {
                Some(replies) => return Ok(TxnOutcome::Committed(replies)),
                None => {
                    debug!(operation, attempt = attempts, "watched key changed, retrying");
                }
            },
        }
    }

    Err(CoordinationError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use latchkey_store::InMemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_commit_without_conflict() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "1")).await.unwrap();

        let outcome = run_optimistic(&store, &["k".to_string()], RetryBudget::default(), "bump", |session| {
            Box::pin(async move {
                let value = session.execute(Command::get("k")).await?.into_optional_text()?;
                let next = value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
                Ok(Plan::<()>::Commit(vec![Command::set("k", next.to_string())]))
            })
        })
        .await
        .unwrap();

        assert!(matches!(outcome, TxnOutcome::Committed(_)));
        assert_eq!(store.execute(Command::get("k")).await.unwrap(), Reply::Text("2".into()));
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let store = InMemoryStore::new();
        let calls = AtomicU32::new(0);

        let outcome = run_optimistic(&store, &["k".to_string()], RetryBudget::Attempts(5), "abort", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Plan::Abort("not mine")) })
        })
        .await
        .unwrap();

        assert_eq!(outcome, TxnOutcome::Aborted("not mine"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_retries_with_fresh_reads() {
        let store = InMemoryStore::new();
        store.execute(Command::set("k", "0")).await.unwrap();
        let interfered = Arc::new(AtomicU32::new(0));

        let outcome = run_optimistic(&store, &["k".to_string()], RetryBudget::Attempts(5), "bump", |session| {
            let store = Arc::clone(&store);
            let interfered = Arc::clone(&interfered);
            Box::pin(async move {
                let value = session.execute(Command::get("k")).await?.into_optional_text()?;
                // Interfere on the first attempt only.
                if interfered.fetch_add(1, Ordering::SeqCst) == 0 {
                    store.execute(Command::set("k", "10")).await?;
                }
                let next = value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
                Ok(Plan::<()>::Commit(vec![Command::set("k", next.to_string())]))
            })
        })
        .await
        .unwrap();

        assert!(matches!(outcome, TxnOutcome::Committed(_)));
        assert_eq!(interfered.load(Ordering::SeqCst), 2);
        assert_eq!(store.execute(Command::get("k")).await.unwrap(), Reply::Text("11".into()));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_distinct() {
        let store = InMemoryStore::new();

        let result = run_optimistic(&store, &["k".to_string()], RetryBudget::Attempts(3), "always-conflicts", |session| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                session.execute(Command::get("k")).await?;
                store.execute(Command::incr("k")).await?;
                Ok(Plan::<()>::Commit(vec![Command::set("other", "x")]))
            })
        })
        .await;

        match result {
            Err(CoordinationError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        // Discarded attempts wrote nothing.
        assert_eq!(store.execute(Command::get("other")).await.unwrap(), Reply::Nil);
    }

    #[tokio::test]
    async fn test_deadline_budget_makes_one_attempt() {
        let store = InMemoryStore::new();
        let outcome = run_optimistic(
            &store,
            &["k".to_string()],
            RetryBudget::Deadline(Duration::ZERO),
            "once",
            |_| Box::pin(async { Ok(Plan::<()>::Commit(vec![Command::set("k", "v")])) }),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, TxnOutcome::Committed(_)));
    }
}
