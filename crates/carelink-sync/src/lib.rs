//! Sync manager for CareLink.
//!
//! Drains the offline outbox to the chat server and pulls authoritative room
//! and message lists back into the local store, driven by connectivity.

mod api;
mod connectivity;
mod error;
mod manager;

pub use api::{ChatApi, HttpChatApi, MessageAck};
pub use connectivity::{ConnectivitySource, ManualConnectivity, ProbeConnectivity};
pub use error::{ApiError, ApiResult, SyncError, SyncResult};
pub use manager::{
    ObserverHandle, SubSyncReport, SyncConfig, SyncManager, SyncOutcome, SyncReport, SyncState,
    SyncStatus,
};
