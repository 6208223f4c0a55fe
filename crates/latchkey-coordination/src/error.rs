//! Error types for coordination primitives.

use latchkey_store::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
///
/// Timeouts and lost ownership are not errors; they are reported through `Option`
/// and `bool` results.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The optimistic transaction kept conflicting until its budget ran out.
    #[snafu(display("retries exhausted for {operation}: {attempts} attempts"))]
    RetriesExhausted {
        /// Description of the operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Data in storage is corrupted or unparseable.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// A caller passed an argument the primitive cannot honour.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Underlying storage error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: StoreError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}

/// Result alias for coordination operations.
pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;
