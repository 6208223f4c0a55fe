//! Key-value store abstraction for latchkey.
//!
//! The coordination primitives only need a small set of atomic operations: string
//! cells with expiry, atomic increment, sets, sorted sets, FIFO lists with blocking
//! pop, atomic command batches, and an optimistic watch-then-commit transaction. This
//! crate expresses those as a [`Command`] enum executed through the [`KeyValueStore`]
//! trait and provides two backends:
//!
//! - [`InMemoryStore`] - single-process, used by tests and embedded deployments
//! - [`RedisStore`] - a Redis server, through the `redis` client crate
//!
//! ## Optimistic transaction
//!
//! ```ignore
//! let mut session = store.watch(vec!["lock:a".into()]).await?;
//! let holder = session.execute(Command::get("lock:a")).await?.into_optional_text()?;
//! if holder.as_deref() == Some(token) {
//!     match session.commit(vec![Command::del("lock:a")]).await? {
//!         Some(_) => { /* applied */ }
//!         None => { /* lock:a changed, retry */ }
//!     }
//! } else {
//!     session.discard().await?;
//! }
//! ```

mod command;
mod error;
mod inmemory;
mod redis_store;
mod traits;

pub use command::Aggregate;
pub use command::Command;
pub use command::KeyTtl;
pub use command::Reply;
pub use command::ScoreBound;
pub use command::SetCondition;
pub use command::format_score;
pub use command::parse_score;
pub use error::StoreError;
pub use inmemory::InMemoryStore;
pub use redis_store::RedisConfig;
pub use redis_store::RedisStore;
pub use traits::KeyValueStore;
pub use traits::WatchSession;
