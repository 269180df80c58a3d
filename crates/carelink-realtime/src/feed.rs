//! Change feeds: where server-pushed records come from.
//!
//! Events are delivered per topic in publish order. A subscriber only sees
//! events published after it subscribed.

use crate::{RealtimeResult, Topic};
use async_trait::async_trait;
use carelink_store::{NewMembership, NewMessage, NewRoom};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A record pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "record", rename_all = "lowercase")]
pub enum FeedEvent {
    Message(NewMessage),
    Room(NewRoom),
    Member(NewMembership),
}

/// Source of server-pushed records.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start receiving events for `topic`. The stream ends when the feed
    /// closes the topic.
    async fn subscribe(&self, topic: &Topic) -> RealtimeResult<mpsc::UnboundedReceiver<FeedEvent>>;
}

/// In-process feed. Hosts bridge their network subscription into it with
/// [`publish`](ChannelFeed::publish).
#[derive(Debug, Default)]
pub struct ChannelFeed {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<FeedEvent>>>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber of `topic`. Dropped
    /// subscribers are pruned. Returns how many received it.
    pub fn publish(&self, topic: &Topic, event: FeedEvent) -> usize {
        let mut subscribers = self.subscribers.write();
        let Some(senders) = subscribers.get_mut(&topic.key()) else {
            return 0;
        };
        senders.retain(|sender| sender.send(event.clone()).is_ok());
        senders.len()
    }

    /// End every stream on `topic`.
    pub fn close_topic(&self, topic: &Topic) {
        self.subscribers.write().remove(&topic.key());
    }

    /// May include subscribers dropped since the last publish.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers
            .read()
            .get(&topic.key())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn subscribe(&self, topic: &Topic) -> RealtimeResult<mpsc::UnboundedReceiver<FeedEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(topic.key())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
