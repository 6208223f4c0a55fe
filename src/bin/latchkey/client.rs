//! Store connection and primitive construction for CLI commands.

use std::sync::Arc;

use anyhow::Result;
use latchkey::LatchkeyConfig;
use latchkey::connect_store;
use latchkey::coordination::HandlerRegistry;
use latchkey::coordination::IdGenerator;
use latchkey::coordination::MutexLock;
use latchkey::coordination::SemaphoreManager;
use latchkey::coordination::TaskQueue;
use latchkey::coordination::Worker;
use latchkey::store::KeyValueStore;

/// Shared store handle plus the configuration commands build primitives from.
pub struct LatchkeyClient {
    store: Arc<dyn KeyValueStore>,
    ids: Arc<IdGenerator>,
    config: LatchkeyConfig,
}

impl LatchkeyClient {
    pub async fn connect(config: LatchkeyConfig) -> Result<Self> {
        let store = connect_store(&config.store).await?;
        Ok(Self {
            store,
            ids: Arc::new(IdGenerator::new()),
            config,
        })
    }

    pub fn config(&self) -> &LatchkeyConfig {
        &self.config
    }

    pub fn lock(&self) -> MutexLock<dyn KeyValueStore> {
        MutexLock::with_config(Arc::clone(&self.store), Arc::clone(&self.ids), self.config.lock.lock_config())
    }

    pub fn semaphores(&self) -> SemaphoreManager<dyn KeyValueStore> {
        SemaphoreManager::new(Arc::clone(&self.store))
            .with_ids(Arc::clone(&self.ids))
            .with_config(self.config.semaphore.semaphore_config())
            .with_lock_config(self.config.lock.lock_config())
    }

    pub fn queue(&self) -> TaskQueue<dyn KeyValueStore> {
        TaskQueue::new(Arc::clone(&self.store))
            .with_ids(Arc::clone(&self.ids))
            .with_config(self.config.queue.queue_config())
            .with_lock_config(self.config.lock.lock_config())
    }

    pub fn worker(&self, registry: HandlerRegistry) -> Worker<dyn KeyValueStore> {
        Worker::new(Arc::clone(&self.store), registry).with_config(self.config.worker.worker_config())
    }
}
