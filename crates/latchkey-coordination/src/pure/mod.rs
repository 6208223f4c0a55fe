//! Pure functions behind the coordination primitives.
//!
//! This module implements the "Functional Core, Imperative Shell" pattern: key
//! layout, deadline math, admission checks and identifier sequencing live here as
//! deterministic functions, and the async managers only move data between these
//! functions and the store.
//!
//! # Module Organization
//!
//! - [`keys`]: Store key layout
//! - [`id`]: Identifier sequencing
//! - [`lock`]: Acquisition timeout floor
//! - [`semaphore`]: Expiry sweep bound, admission check
//! - [`queue`]: Due-time computation
//!
//! # Tiger Style
//!
//! - All calculations use saturating arithmetic to prevent overflow/underflow
//! - Time is passed as an explicit parameter
//! - No panics - all functions are total

pub mod id;
pub mod keys;
pub mod lock;
pub mod queue;
pub mod semaphore;
