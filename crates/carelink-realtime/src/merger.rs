//! Subscription-driven merge of server-pushed records.
//!
//! Every event goes through the same insert-or-existing write a local
//! producer uses, so a record that arrives both by realtime push and by
//! pull or local creation is stored once.

use crate::{ChangeFeed, FeedEvent, RealtimeResult, Topic};
use async_trait::async_trait;
use carelink_store::{
    Membership, Merged, Message, MessageStatus, NewMembership, NewMessage, NewRoom, RecordStore,
    Room, StoreResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A record kind the merger can fold into the store.
#[async_trait]
trait MergeTarget: Sized + Send + 'static {
    type Incoming: Send + 'static;

    fn accept(event: FeedEvent) -> Option<Self::Incoming>;

    async fn merge(store: &RecordStore, incoming: Self::Incoming) -> StoreResult<Merged<Self>>;
}

#[async_trait]
impl MergeTarget for Message {
    type Incoming = NewMessage;

    fn accept(event: FeedEvent) -> Option<NewMessage> {
        match event {
            FeedEvent::Message(message) => Some(message),
            _ => None,
        }
    }

    async fn merge(store: &RecordStore, incoming: NewMessage) -> StoreResult<Merged<Message>> {
        store.insert_message(incoming, MessageStatus::Ack).await
    }
}

#[async_trait]
impl MergeTarget for Room {
    type Incoming = NewRoom;

    fn accept(event: FeedEvent) -> Option<NewRoom> {
        match event {
            FeedEvent::Room(room) => Some(room),
            _ => None,
        }
    }

    async fn merge(store: &RecordStore, incoming: NewRoom) -> StoreResult<Merged<Room>> {
        store.insert_room(incoming).await
    }
}

#[async_trait]
impl MergeTarget for Membership {
    type Incoming = NewMembership;

    fn accept(event: FeedEvent) -> Option<NewMembership> {
        match event {
            FeedEvent::Member(member) => Some(member),
            _ => None,
        }
    }

    async fn merge(store: &RecordStore, incoming: NewMembership) -> StoreResult<Merged<Membership>> {
        store.add_member(incoming).await
    }
}

/// Owns one merge task per active topic.
pub struct RealtimeMerger {
    store: RecordStore,
    feed: Arc<dyn ChangeFeed>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RealtimeMerger {
    pub fn new(store: RecordStore, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Merge messages pushed for `room_id`, stored as `ack`.
    pub async fn subscribe_to_messages<F>(&self, room_id: &str, on_merge: F) -> RealtimeResult<String>
    where
        F: Fn(Merged<Message>) + Send + Sync + 'static,
    {
        self.subscribe::<Message, F>(Topic::messages(room_id), on_merge)
            .await
    }

    pub async fn subscribe_to_rooms<F>(&self, on_merge: F) -> RealtimeResult<String>
    where
        F: Fn(Merged<Room>) + Send + Sync + 'static,
    {
        self.subscribe::<Room, F>(Topic::rooms(), on_merge).await
    }

    pub async fn subscribe_to_members<F>(&self, room_id: &str, on_merge: F) -> RealtimeResult<String>
    where
        F: Fn(Merged<Membership>) + Send + Sync + 'static,
    {
        self.subscribe::<Membership, F>(Topic::members(room_id), on_merge)
            .await
    }

    async fn subscribe<T, F>(&self, topic: Topic, on_merge: F) -> RealtimeResult<String>
    where
        T: MergeTarget,
        F: Fn(Merged<T>) + Send + Sync + 'static,
    {
        let key = topic.key();
        let mut events = self.feed.subscribe(&topic).await?;
        let store = self.store.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(incoming) = T::accept(event) else {
                    debug!(topic = %task_key, "Ignoring event of another kind");
                    continue;
                };
                match T::merge(&store, incoming).await {
                    Ok(merged) => on_merge(merged),
                    Err(e) if e.is_unavailable() => {
                        warn!(topic = %task_key, error = %e, "Store unavailable, ending subscription");
                        break;
                    }
                    Err(e) => {
                        warn!(topic = %task_key, error = %e, "Failed to merge realtime record");
                    }
                }
            }
            debug!(topic = %task_key, "Realtime subscription ended");
        });

        if let Some(previous) = self.subscriptions.lock().insert(key.clone(), handle) {
            previous.abort();
            debug!(topic = %key, "Replaced existing subscription");
        }
        info!(topic = %key, "Realtime subscription started");
        Ok(key)
    }

    /// Stop the subscription with `key`. Returns false if none was active.
    pub fn unsubscribe(&self, key: &str) -> bool {
        match self.subscriptions.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                debug!(topic = %key, "Realtime subscription stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every subscription. Returns how many there were.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<_> = self.subscriptions.lock().drain().collect();
        for (_, handle) in &drained {
            handle.abort();
        }
        drained.len()
    }

    /// Keys of subscriptions whose task is still running, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|_, handle| !handle.is_finished());
        let mut keys: Vec<String> = subscriptions.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Drop for RealtimeMerger {
    fn drop(&mut self) {
        for (_, handle) in self.subscriptions.get_mut().drain() {
            handle.abort();
        }
    }
}
