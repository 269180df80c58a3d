//! Offline outbox for CareLink.
//!
//! Messages composed while offline are staged here and retried with
//! exponential backoff until the server accepts them or the retry ceiling
//! is reached.

mod error;
mod policy;
mod queue;

pub use carelink_store::OutboxFailure;
pub use error::{OutboxError, OutboxResult};
pub use policy::{compute_backoff, RetryPolicy};
pub use queue::OutboxQueue;
