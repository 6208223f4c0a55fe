//! Error types for key-value store backends.

use snafu::Snafu;

/// Errors that can occur when talking to a key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Could not establish a connection to the store.
    #[snafu(display("failed to connect to {addr}: {reason}"))]
    Connection {
        /// Address we tried to reach.
        addr: String,
        /// Underlying failure.
        reason: String,
    },

    /// I/O failure on an established connection.
    #[snafu(display("store I/O error: {reason}"))]
    Io { reason: String },

    /// The peer sent bytes that do not form a valid reply.
    #[snafu(display("protocol error: {reason}"))]
    Protocol { reason: String },

    /// The store rejected a command.
    #[snafu(display("store error: {message}"))]
    Server { message: String },

    /// A command targeted a key holding the wrong kind of value.
    #[snafu(display("wrong type for key '{key}'"))]
    WrongType { key: String },

    /// An increment targeted a value that is not an integer.
    #[snafu(display("value at '{key}' is not an integer"))]
    NotAnInteger { key: String },

    /// A reply did not have the shape the command produces.
    #[snafu(display("expected {expected} reply, got {reply}"))]
    UnexpectedReply {
        /// Shape the caller expected.
        expected: String,
        /// Debug rendering of the reply.
        reply: String,
    },

    /// The command is malformed or not allowed in this context.
    #[snafu(display("invalid command: {reason}"))]
    InvalidCommand { reason: String },

    /// The server did not answer within the response timeout.
    #[snafu(display("store operation timed out after {duration_ms}ms"))]
    Timeout { duration_ms: u64 },
}
