//! Command modules for latchkey.
//!
//! Each module handles a category of operations.

pub mod lock;
pub mod mover;
pub mod queue;
pub mod semaphore;
pub mod task;
pub mod worker;
