//! Retention error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Store error: {0}")]
    Store(#[from] carelink_store::StoreError),
}

impl RetentionError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_unavailable())
    }
}

pub type RetentionResult<T> = Result<T, RetentionError>;
