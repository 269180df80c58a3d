//! Realtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Store error: {0}")]
    Store(#[from] carelink_store::StoreError),

    /// The feed refused or dropped the subscription.
    #[error("Feed unavailable for {topic}: {reason}")]
    Feed { topic: String, reason: String },
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;
