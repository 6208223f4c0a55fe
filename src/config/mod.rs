//! Application configuration
//!
//! Configuration is layered: hardcoded defaults, then an optional TOML file, then
//! `LATCHKEY_*` environment variables. Every section may be omitted from the file.
//!
//! ```toml
//! [store]
//! backend = "redis"
//!
//! [store.redis]
//! addr = "127.0.0.1:6379"
//! db = 0
//!
//! [queue]
//! mover_idle_ms = 10
//!
//! [worker]
//! queues = ["high", "default"]
//! block_timeout_ms = 1000
//! ```

pub mod error;

use std::path::Path;
use std::time::Duration;

use latchkey_coordination::LockConfig;
use latchkey_coordination::QueueConfig;
use latchkey_coordination::RetryBudget;
use latchkey_coordination::SemaphoreConfig;
use latchkey_coordination::WorkerConfig;
use latchkey_coordination::constants::MAX_MOVER_IDLE_MS;
use latchkey_coordination::constants::MAX_WORKER_QUEUES;
use latchkey_store::RedisConfig;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;

pub use self::error::ConfigError;
use self::error::ParseSnafu;
use self::error::ReadFileSnafu;

/// Environment variable overriding `store.redis.addr`.
pub const ENV_REDIS_ADDR: &str = "LATCHKEY_REDIS_ADDR";
/// Environment variable overriding `store.redis.password`.
pub const ENV_REDIS_PASSWORD: &str = "LATCHKEY_REDIS_PASSWORD";
/// Environment variable overriding `store.redis.db`.
pub const ENV_REDIS_DB: &str = "LATCHKEY_REDIS_DB";

/// Serde default values.
mod defaults {
    pub fn lock_acquire_timeout_ms() -> u64 {
        1_000
    }

    pub fn lock_retry_interval_ms() -> u64 {
        latchkey_coordination::constants::LOCK_RETRY_INTERVAL_MS
    }

    pub fn semaphore_limit() -> u32 {
        1
    }

    pub fn semaphore_timeout_ms() -> u64 {
        10_000
    }

    pub fn guard_timeout_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_GUARD_LOCK_TIMEOUT_MS
    }

    pub fn guard_lease_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_GUARD_LOCK_LEASE_MS
    }

    pub fn mover_idle_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_MOVER_IDLE_MS
    }

    pub fn promote_lock_timeout_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_PROMOTE_LOCK_TIMEOUT_MS
    }

    pub fn promote_lease_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_PROMOTE_LEASE_MS
    }

    pub fn worker_queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    pub fn block_timeout_ms() -> u64 {
        latchkey_coordination::constants::DEFAULT_BLOCK_TIMEOUT.as_millis() as u64
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatchkeyConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub semaphore: SemaphoreSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// A Redis server, shared between processes.
    #[default]
    Redis,
    /// An in-process store. State is lost when the process exits.
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSection {
    /// Default acquire timeout for CLI lock commands.
    #[serde(default = "defaults::lock_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Pause between acquisition attempts.
    #[serde(default = "defaults::lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: defaults::lock_acquire_timeout_ms(),
            retry_interval_ms: defaults::lock_retry_interval_ms(),
        }
    }
}

impl LockSection {
    /// Lock settings with durations in place of milliseconds.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            release_budget: RetryBudget::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreSection {
    /// Default slot count for CLI semaphore commands.
    #[serde(default = "defaults::semaphore_limit")]
    pub limit: u32,
    /// Holders older than this are swept.
    #[serde(default = "defaults::semaphore_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::guard_timeout_ms")]
    pub guard_timeout_ms: u64,
    #[serde(default = "defaults::guard_lease_ms")]
    pub guard_lease_ms: u64,
}

impl Default for SemaphoreSection {
    fn default() -> Self {
        Self {
            limit: defaults::semaphore_limit(),
            timeout_ms: defaults::semaphore_timeout_ms(),
            guard_timeout_ms: defaults::guard_timeout_ms(),
            guard_lease_ms: defaults::guard_lease_ms(),
        }
    }
}

impl SemaphoreSection {
    /// Guard lock settings for the semaphore manager.
    pub fn semaphore_config(&self) -> SemaphoreConfig {
        SemaphoreConfig {
            guard_timeout: Duration::from_millis(self.guard_timeout_ms),
            guard_lease: Duration::from_millis(self.guard_lease_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "defaults::mover_idle_ms")]
    pub mover_idle_ms: u64,
    #[serde(default = "defaults::promote_lock_timeout_ms")]
    pub promote_lock_timeout_ms: u64,
    #[serde(default = "defaults::promote_lease_ms")]
    pub promote_lease_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            mover_idle_ms: defaults::mover_idle_ms(),
            promote_lock_timeout_ms: defaults::promote_lock_timeout_ms(),
            promote_lease_ms: defaults::promote_lease_ms(),
        }
    }
}

impl QueueSection {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            mover_idle: Duration::from_millis(self.mover_idle_ms),
            promote_lock_timeout: Duration::from_millis(self.promote_lock_timeout_ms),
            promote_lease: Duration::from_millis(self.promote_lease_ms),
            promote_budget: RetryBudget::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Ready queues in priority order.
    #[serde(default = "defaults::worker_queues")]
    pub queues: Vec<String>,
    #[serde(default = "defaults::block_timeout_ms")]
    pub block_timeout_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            queues: defaults::worker_queues(),
            block_timeout_ms: defaults::block_timeout_ms(),
        }
    }
}

impl WorkerSection {
    /// Worker settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            block_timeout: Duration::from_millis(self.block_timeout_ms),
        }
    }
}

impl LatchkeyConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&contents).context(ParseSnafu { path })
    }

    /// Load configuration with the layered approach:
    /// 1. Start with defaults, or the TOML file at `path` if given
    /// 2. Override with environment variables
    /// 3. Validate
    pub fn load_with_optional_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "loading configuration file");
                Self::from_toml_file(path)?
            }
            None => {
                debug!("no configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LATCHKEY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(addr) = lookup(ENV_REDIS_ADDR) {
            self.store.redis.addr = addr;
        }
        if let Some(password) = lookup(ENV_REDIS_PASSWORD) {
            self.store.redis.password = Some(password);
        }
        if let Some(db) = lookup(ENV_REDIS_DB) {
            self.store.redis.db = db.parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_REDIS_DB.to_string(),
                value: db.clone(),
                reason: format!("not a database index: {}", e),
            })?;
        }
        Ok(())
    }

    /// Check values the primitives cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Redis && self.store.redis.addr.trim().is_empty() {
            return Err(invalid("store.redis.addr", "", "must not be empty"));
        }
        if self.store.redis.connect_timeout_ms == 0 {
            return Err(invalid("store.redis.connect_timeout_ms", 0, "must be positive"));
        }
        if self.store.redis.response_timeout_ms == 0 {
            return Err(invalid("store.redis.response_timeout_ms", 0, "must be positive"));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(invalid("lock.retry_interval_ms", 0, "must be positive"));
        }
        if self.semaphore.limit == 0 {
            return Err(invalid("semaphore.limit", 0, "must be positive"));
        }
        if self.semaphore.guard_lease_ms == 0 {
            return Err(invalid("semaphore.guard_lease_ms", 0, "must be positive"));
        }
        if self.queue.mover_idle_ms == 0 || self.queue.mover_idle_ms > MAX_MOVER_IDLE_MS {
            return Err(invalid(
                "queue.mover_idle_ms",
                self.queue.mover_idle_ms,
                &format!("must be between 1 and {}", MAX_MOVER_IDLE_MS),
            ));
        }
        if self.queue.promote_lease_ms == 0 {
            return Err(invalid("queue.promote_lease_ms", 0, "must be positive"));
        }
        if self.worker.block_timeout_ms == 0 {
            return Err(invalid("worker.block_timeout_ms", 0, "must be positive"));
        }
        if self.worker.queues.is_empty() || self.worker.queues.len() > MAX_WORKER_QUEUES {
            return Err(invalid(
                "worker.queues",
                self.worker.queues.len(),
                &format!("need between 1 and {} queues", MAX_WORKER_QUEUES),
            ));
        }
        if let Some(empty) = self.worker.queues.iter().position(|q| q.is_empty()) {
            return Err(invalid(&format!("worker.queues[{}]", empty), "", "queue names must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
