//! Store traits shared by all backends.

use async_trait::async_trait;

use crate::command::Command;
use crate::command::Reply;
use crate::error::StoreError;

/// Shared key-value store interface.
///
/// A backend must apply each command atomically, apply `execute_batch` with no
/// interleaving from other clients, and honour the watch contract of [`WatchSession`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Execute a single command.
    async fn execute(&self, command: Command) -> Result<Reply, StoreError>;

    /// Execute a batch of commands atomically (MULTI/EXEC).
    ///
    /// Blocking commands are rejected with [`StoreError::InvalidCommand`].
    async fn execute_batch(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError>;

    /// Start an optimistic transaction watching `keys`.
    async fn watch(&self, keys: Vec<String>) -> Result<Box<dyn WatchSession>, StoreError>;
}

/// An open optimistic transaction.
///
/// Reads go through [`WatchSession::execute`]. [`WatchSession::commit`] applies the batch
/// only if none of the watched keys changed (written, deleted or expired) since the
/// session was opened.
#[async_trait]
pub trait WatchSession: Send {
    /// Execute a command outside the transaction batch, typically a read.
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError>;

    /// Commit `commands` atomically.
    ///
    /// Returns `Ok(None)` when a watched key changed and nothing was applied.
    async fn commit(self: Box<Self>, commands: Vec<Command>) -> Result<Option<Vec<Reply>>, StoreError>;

    /// Abandon the transaction without writing.
    async fn discard(self: Box<Self>) -> Result<(), StoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        (**self).execute(command).await
    }

    async fn execute_batch(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        (**self).execute_batch(commands).await
    }

    async fn watch(&self, keys: Vec<String>) -> Result<Box<dyn WatchSession>, StoreError> {
        (**self).watch(keys).await
    }
}

pub(crate) fn reject_blocking(commands: &[Command]) -> Result<(), StoreError> {
    match commands.iter().find(|c| c.is_blocking()) {
        Some(cmd) => Err(StoreError::InvalidCommand {
            reason: format!("{} is not allowed in a batch", cmd.name()),
        }),
        None => Ok(()),
    }
}
