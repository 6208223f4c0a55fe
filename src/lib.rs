//! Distributed locks, semaphores and delayed task queues over a shared key-value store.
//!
//! The primitives live in [`coordination`] and run against any [`store::KeyValueStore`].
//! This crate adds layered configuration and store selection for the `latchkey`
//! binary and for applications embedding the primitives.

pub mod config;

use std::sync::Arc;

pub use latchkey_coordination as coordination;
pub use latchkey_store as store;
use latchkey_store::InMemoryStore;
use latchkey_store::KeyValueStore;
use latchkey_store::RedisStore;
use latchkey_store::StoreError;
use tracing::info;

pub use crate::config::ConfigError;
pub use crate::config::LatchkeyConfig;
pub use crate::config::StoreBackend;
pub use crate::config::StoreConfig;

/// Open the store selected by `config`.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    let store: Arc<dyn KeyValueStore> = match config.backend {
        StoreBackend::Memory => {
            info!("using in-process store");
            InMemoryStore::new()
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(config.redis.clone()).await?;
            info!(addr = %config.redis.addr, db = config.redis.db, "connected to redis");
            store
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use latchkey_store::Command;
    use latchkey_store::Reply;

    use super::*;

    #[tokio::test]
    async fn test_memory_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..StoreConfig::default()
        };
        let store = connect_store(&config).await.unwrap();
        store.execute(Command::set("k", "v")).await.unwrap();
        assert_eq!(store.execute(Command::get("k")).await.unwrap(), Reply::Text("v".to_string()));
    }
}
