//! Realtime merge layer for CareLink.
//!
//! Folds server-pushed rooms, messages and memberships into the local store
//! with the same duplicate-as-success rule local writers use.

mod error;
mod feed;
mod merger;
mod topic;

pub use error::{RealtimeError, RealtimeResult};
pub use feed::{ChangeFeed, ChannelFeed, FeedEvent};
pub use merger::RealtimeMerger;
pub use topic::{EntityKind, Scope, Topic};
