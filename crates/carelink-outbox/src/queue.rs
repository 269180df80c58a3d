//! Durable outbox over the record store.
//!
//! Every locally composed message is written together with its outbox item,
//! so a crash between "saved" and "queued" is impossible. Items carry the
//! wire payload, an attempt counter and the time of their next attempt.

use crate::{OutboxError, OutboxResult, RetryPolicy};
use carelink_core::Clock;
use carelink_store::{
    Merged, Message, NewMessage, NewOutboxItem, OutboxFailure, OutboxItem, RecordStore,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persistent queue of messages waiting to be delivered.
#[derive(Clone)]
pub struct OutboxQueue {
    store: RecordStore,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl OutboxQueue {
    pub fn new(store: RecordStore, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Save a locally composed message and queue it for delivery.
    ///
    /// The queued payload is the message in wire form. Staging the same cid
    /// twice returns the stored message without queuing a second item.
    pub async fn stage_message(&self, message: NewMessage) -> OutboxResult<Merged<Message>> {
        let payload = serde_json::to_value(&message)?;
        let merged = self
            .store
            .create_message(message, payload, self.clock.now())
            .await?;
        if !merged.inserted {
            debug!(cid = %merged.record.cid, "Message already staged");
        }
        Ok(merged)
    }

    /// Queue an item for a message that is already stored and awaiting
    /// delivery. Enqueueing a cid that is already queued is a no-op.
    pub async fn enqueue(
        &self,
        cid: &str,
        room_id: &str,
        payload: serde_json::Value,
    ) -> OutboxResult<OutboxItem> {
        let now = self.clock.now();
        let item = NewOutboxItem {
            cid: cid.to_string(),
            room_id: room_id.to_string(),
            payload,
            created_at: now,
        };
        let merged = self.store.stage_outbox_item(item, now).await?;
        if merged.inserted {
            debug!(cid, room_id, "Outbox item enqueued");
        }
        Ok(merged.record)
    }

    /// Items whose next attempt is due, oldest first.
    pub async fn pending(&self) -> OutboxResult<Vec<OutboxItem>> {
        Ok(self.store.due_outbox_items(self.clock.now()).await?)
    }

    /// Every queued item regardless of schedule.
    pub async fn items(&self) -> OutboxResult<Vec<OutboxItem>> {
        Ok(self.store.list_outbox_items().await?)
    }

    pub async fn len(&self) -> OutboxResult<u64> {
        Ok(self.store.outbox_len().await?)
    }

    pub async fn is_empty(&self) -> OutboxResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Flag a queued message as in flight.
    pub async fn mark_sending(&self, cid: &str) -> OutboxResult<bool> {
        Ok(self.store.mark_sending(cid).await?)
    }

    /// The server accepted the message: drop the item and mark it `ack`.
    ///
    /// Returns false if the item had already been resolved.
    pub async fn record_success(&self, cid: &str) -> OutboxResult<bool> {
        let completed = self.store.complete_outbox_item(cid).await?;
        if completed {
            debug!(cid, "Outbox item delivered");
        } else {
            debug!(cid, "Outbox item already resolved");
        }
        Ok(completed)
    }

    /// Count a failed attempt, rescheduling or abandoning the item.
    ///
    /// Returns `None` if the item is no longer queued.
    pub async fn record_failure(
        &self,
        cid: &str,
        error: &str,
    ) -> OutboxResult<Option<OutboxFailure>> {
        let policy = self.policy.clone();
        let now = self.clock.now();
        let outcome = self
            .store
            .record_outbox_failure(cid, error.to_string(), policy.max_attempts, move |attempt, previous| {
                policy.next_attempt_at(attempt, now, previous)
            })
            .await?;

        match &outcome {
            Some(OutboxFailure::Rescheduled {
                attempt,
                next_attempt_at,
            }) => {
                debug!(cid, attempt, next_attempt_at = %next_attempt_at, error, "Outbox item rescheduled");
            }
            Some(OutboxFailure::Abandoned { attempt }) => {
                warn!(cid, attempt, error, "Outbox item abandoned after max attempts");
            }
            None => debug!(cid, "Failure reported for an item that is no longer queued"),
        }
        Ok(outcome)
    }

    /// Re-queue a `failed` message from its stored content.
    pub async fn retry_failed(&self, cid: &str) -> OutboxResult<OutboxItem> {
        let message = self
            .store
            .get_message_by_cid(cid)
            .await?
            .ok_or_else(|| OutboxError::NotFound(cid.to_string()))?;
        let payload = serde_json::to_value(wire_form(&message))?;
        let item = self
            .store
            .restage_failed_message(cid, payload, self.clock.now())
            .await?;
        info!(cid, room_id = %item.room_id, "Failed message queued for retry");
        Ok(item)
    }
}

fn wire_form(message: &Message) -> NewMessage {
    NewMessage {
        cid: message.cid.clone(),
        room_id: message.room_id.clone(),
        sender_id: message.sender_id.clone(),
        created_at: message.created_at,
        content: message.content.clone(),
        reply_to: message.reply_to.clone(),
        reactions: message.reactions.clone(),
    }
}
