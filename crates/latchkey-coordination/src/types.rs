//! Shared types for coordination primitives.

use serde::Deserialize;
use serde::Serialize;

use crate::error::CoordinationError;

/// Ownership claim returned by a successful lock or semaphore acquisition.
///
/// Pass it back to release or refresh. Tokens are unique per acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap an existing token value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The token value as written to the store.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the token value.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A task as stored in `delayed:` and the ready queues.
///
/// The serialized form is the store value; it is never re-encoded between
/// scheduling and delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier.
    pub id: String,
    /// Destination ready queue name (without the `queue:` prefix).
    pub queue: String,
    /// Handler name looked up by workers.
    pub name: String,
    /// Opaque payload interpreted by the handler.
    pub args: String,
}

impl TaskRecord {
    /// JSON form stored in queue lists.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON form produced by [`TaskRecord::encode`].
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Decode an entry read from `key`, reporting a bad entry as corrupted data.
    pub fn decode_stored(key: &str, raw: &str) -> Result<Self, CoordinationError> {
        Self::decode(raw).map_err(|e| CoordinationError::CorruptedData {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Source of wall-clock time in Unix milliseconds.
///
/// Semaphore scores and task due times are read through this so tests can give
/// each client its own skewed clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_unix_ms(&self) -> u64;
}

/// The host clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        now_unix_ms()
    }
}

/// The host clock shifted by a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct SkewedClock {
    offset_ms: i64,
}

impl SkewedClock {
    /// Clock that reads the system time shifted by `offset_ms`.
    pub fn new(offset_ms: i64) -> Self {
        Self { offset_ms }
    }
}

impl Clock for SkewedClock {
    fn now_unix_ms(&self) -> u64 {
        now_unix_ms().saturating_add_signed(self.offset_ms)
    }
}

/// Get current Unix timestamp in milliseconds.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
