//! Sync error types.

use thiserror::Error;

/// Failure talking to the chat server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure: connect, TLS, timeout.
    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("Server error: {status} - {message}")]
    Status { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered but the response does not acknowledge the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Invalid server URL or client settings.
    #[error("Configuration error: {0}")]
    Config(#[from] carelink_core::CoreError),
}

impl ApiError {
    /// Worth retrying: transport errors, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Json(_) | Self::Rejected(_) | Self::Config(_) => false,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] carelink_store::StoreError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] carelink_outbox::OutboxError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

impl SyncError {
    /// The local store cannot be reached; no sync can make progress.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_unavailable(),
            Self::Outbox(e) => e.is_unavailable(),
            Self::Api(_) => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
