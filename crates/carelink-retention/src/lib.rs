//! Local retention for CareLink.
//!
//! Evicts messages past the retention window and clears outbox items that
//! have run out of retries.

mod error;
mod sweep;
mod sweeper;

pub use error::{RetentionError, RetentionResult};
pub use sweep::{EvictionSweep, DEFAULT_PAGE_SIZE};
pub use sweeper::{CleanupSweeper, SweepReport};
