//! Unique identifier generation for tokens and task ids.

use parking_lot::Mutex;
use tracing::trace;

use crate::pure::id::IdSlot;
use crate::pure::id::next_slot;
use crate::types::Token;
use crate::types::now_unix_ms;

/// Generates identifiers of the form `<sequence>-<node>`.
///
/// `sequence` is strictly increasing within one generator and roughly follows
/// wall-clock time, so identifiers sort by creation. `node` is a random suffix chosen
/// at construction, which keeps identifiers from different generators (and processes)
/// distinct.
#[derive(Debug)]
pub struct IdGenerator {
    node: String,
    last: Mutex<Option<IdSlot>>,
}

impl IdGenerator {
    /// Create a generator with a random node suffix.
    pub fn new() -> Self {
        let mut node = uuid::Uuid::new_v4().simple().to_string();
        node.truncate(8);
        Self::with_node(node)
    }

    /// Create a generator with a fixed node suffix.
    pub fn with_node(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            last: Mutex::new(None),
        }
    }

    /// Node suffix shared by every id from this generator.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Produce the next identifier.
    pub fn next_id(&self) -> String {
        let slot = {
            let mut last = self.last.lock();
            let slot = next_slot(*last, now_unix_ms() / 1000);
            *last = Some(slot);
            slot
        };
        trace!(sequence = slot.value(), node = %self.node, "issued id");
        format!("{}-{}", slot.value(), self.node)
    }

    /// Produce a fresh ownership token.
    pub fn next_token(&self) -> Token {
        Token::new(self.next_id())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
