//! The record store: typed async operations over every record kind.

use crate::{
    migrations, queries, AsyncDatabase, EvictionPage, MediaBlob, Membership, MemberRole, Merged,
    Message, MessageKey, MessageStatus, NewMediaBlob, NewMembership, NewMessage, NewOutboxItem,
    NewRoom, OutboxFailure, OutboxItem, ReadReceipt, Room, StorageUsage, StoreError, StoreResult,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info, warn};

/// Handle to the local store. Cheap to clone; all clones share one executor.
#[derive(Clone)]
pub struct RecordStore {
    db: AsyncDatabase,
}

impl RecordStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            db: AsyncDatabase::open(path).await?,
        })
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            db: AsyncDatabase::open_in_memory().await?,
        })
    }

    pub fn path(&self) -> &str {
        self.db.path()
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        self.db.health_check().await
    }

    pub async fn close(self) -> StoreResult<()> {
        self.db.close().await
    }

    pub async fn schema_version(&self) -> StoreResult<i64> {
        self.db.call(migrations::current_version).await
    }

    /// Revert the schema to `target`. Development only.
    pub async fn rollback_schema_to(&self, target: i64) -> StoreResult<usize> {
        self.db
            .call(move |conn| migrations::rollback_to(conn, target))
            .await
    }

    // ==========================================
    // Messages
    // ==========================================

    /// Write a locally composed message in `local` together with its outbox
    /// item. An existing cid returns the stored message and writes nothing.
    pub async fn create_message(
        &self,
        message: NewMessage,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<Merged<Message>> {
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let merged = queries::merge_message(&tx, &message, MessageStatus::Local)?;
                if merged.inserted {
                    let item = NewOutboxItem {
                        cid: message.cid.clone(),
                        room_id: message.room_id.clone(),
                        payload,
                        created_at: now,
                    };
                    queries::insert_outbox_item(&tx, &item, &now)?;
                }
                tx.commit()?;

                if merged.inserted {
                    debug!(cid = %message.cid, room_id = %message.room_id, "Message staged for delivery");
                }
                Ok(merged)
            })
            .await
    }

    /// Store a message that already exists on the server (pulled or pushed
    /// in realtime). A duplicate cid is success and leaves the stored record
    /// untouched.
    pub async fn insert_message(
        &self,
        message: NewMessage,
        status: MessageStatus,
    ) -> StoreResult<Merged<Message>> {
        if status.awaits_delivery() {
            return Err(StoreError::InvalidData(format!(
                "message {} cannot be stored as {} without an outbox item",
                message.cid,
                status.as_str()
            )));
        }
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let merged = queries::merge_message(&tx, &message, status)?;
                tx.commit()?;
                Ok(merged)
            })
            .await
    }

    pub async fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let id = id.to_string();
        self.db
            .call(move |conn| queries::get_message(conn, &id))
            .await
    }

    /// Look a message up by its idempotency token.
    pub async fn get_message_by_cid(&self, cid: &str) -> StoreResult<Option<Message>> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| queries::get_message_by_cid(conn, &cid))
            .await
    }

    pub async fn get_messages_by_room(&self, room_id: &str) -> StoreResult<Vec<Message>> {
        let room_id = room_id.to_string();
        self.db
            .call(move |conn| queries::get_messages_by_room(conn, &room_id))
            .await
    }

    /// Page backwards through a room's history.
    pub async fn get_messages_page(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let room_id = room_id.to_string();
        self.db
            .call(move |conn| queries::get_messages_page(conn, &room_id, before.as_ref(), limit))
            .await
    }

    pub async fn get_messages_by_status(&self, status: MessageStatus) -> StoreResult<Vec<Message>> {
        self.db
            .call(move |conn| queries::get_messages_by_status(conn, status))
            .await
    }

    /// Change a message's status.
    ///
    /// Returns `Ok(false)` when the status is unchanged or the transition is
    /// not allowed (`ack` only moves to `deleted`; `deleted` is final).
    /// Moving to a status that is not awaiting delivery drops the outbox item
    /// in the same transaction; moving back into delivery requires one to
    /// exist already.
    pub async fn update_message_status(
        &self,
        cid: &str,
        status: MessageStatus,
    ) -> StoreResult<bool> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let current = queries::get_message_by_cid(&tx, &cid)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {cid}")))?;

                if current.status == status {
                    return Ok(false);
                }
                if !current.status.can_transition_to(status) {
                    warn!(
                        cid = %cid,
                        from = current.status.as_str(),
                        to = status.as_str(),
                        "Rejected status transition"
                    );
                    return Ok(false);
                }

                let has_item = queries::get_outbox_item(&tx, &cid)?.is_some();
                if status.awaits_delivery() && !has_item {
                    return Err(StoreError::InvalidData(format!(
                        "message {cid} has no outbox item; re-stage it through the outbox"
                    )));
                }
                if !status.awaits_delivery() && has_item {
                    queries::delete_outbox_item(&tx, &cid)?;
                }

                queries::set_message_status(&tx, &cid, status)?;
                tx.commit()?;
                debug!(cid = %cid, from = current.status.as_str(), to = status.as_str(), "Message status updated");
                Ok(true)
            })
            .await
    }

    /// Soft-delete a message; any pending delivery is cancelled.
    pub async fn delete_message(&self, cid: &str) -> StoreResult<bool> {
        self.update_message_status(cid, MessageStatus::Deleted).await
    }

    /// Add `user_id`'s `emoji` reaction. Returns the updated message.
    pub async fn add_reaction(&self, cid: &str, emoji: &str, user_id: &str) -> StoreResult<Message> {
        self.edit_reactions(cid, emoji, user_id, true).await
    }

    pub async fn remove_reaction(
        &self,
        cid: &str,
        emoji: &str,
        user_id: &str,
    ) -> StoreResult<Message> {
        self.edit_reactions(cid, emoji, user_id, false).await
    }

    async fn edit_reactions(
        &self,
        cid: &str,
        emoji: &str,
        user_id: &str,
        add: bool,
    ) -> StoreResult<Message> {
        let (cid, emoji, user_id) = (cid.to_string(), emoji.to_string(), user_id.to_string());
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let mut message = queries::get_message_by_cid(&tx, &cid)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {cid}")))?;

                if add {
                    message
                        .reactions
                        .entry(emoji)
                        .or_default()
                        .insert(user_id);
                } else if let Some(users) = message.reactions.get_mut(&emoji) {
                    users.remove(&user_id);
                    if users.is_empty() {
                        message.reactions.remove(&emoji);
                    }
                }

                queries::set_reactions(&tx, &cid, &message.reactions)?;
                tx.commit()?;
                Ok(message)
            })
            .await
    }

    // ==========================================
    // Rooms
    // ==========================================

    /// Insert a room; an existing id is success and only advances activity.
    pub async fn insert_room(&self, room: NewRoom) -> StoreResult<Merged<Room>> {
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let merged = queries::merge_room(&tx, &room)?;
                tx.commit()?;
                Ok(merged)
            })
            .await
    }

    pub async fn get_room(&self, id: &str) -> StoreResult<Option<Room>> {
        let id = id.to_string();
        self.db.call(move |conn| queries::get_room(conn, &id)).await
    }

    /// Rooms ordered by latest activity.
    pub async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        self.db.call(queries::list_rooms).await
    }

    /// Advance a room's activity timestamp; never moves it backwards.
    pub async fn touch_room(&self, room_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let room_id = room_id.to_string();
        self.db
            .call(move |conn| queries::touch_room(conn, &room_id, &at))
            .await
    }

    // ==========================================
    // Memberships
    // ==========================================

    pub async fn add_member(&self, member: NewMembership) -> StoreResult<Merged<Membership>> {
        self.db
            .call(move |conn| queries::merge_membership(conn, &member))
            .await
    }

    pub async fn get_members(&self, room_id: &str) -> StoreResult<Vec<Membership>> {
        let room_id = room_id.to_string();
        self.db
            .call(move |conn| queries::get_members(conn, &room_id))
            .await
    }

    pub async fn get_rooms_for_user(&self, user_id: &str) -> StoreResult<Vec<Room>> {
        let user_id = user_id.to_string();
        self.db
            .call(move |conn| queries::get_rooms_for_user(conn, &user_id))
            .await
    }

    pub async fn set_member_role(
        &self,
        room_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> StoreResult<bool> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.db
            .call(move |conn| queries::set_member_role(conn, &room_id, &user_id, role))
            .await
    }

    pub async fn remove_member(&self, room_id: &str, user_id: &str) -> StoreResult<bool> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.db
            .call(move |conn| queries::delete_membership(conn, &room_id, &user_id))
            .await
    }

    // ==========================================
    // Read receipts
    // ==========================================

    pub async fn mark_read(&self, receipt: ReadReceipt) -> StoreResult<()> {
        self.db
            .call(move |conn| queries::upsert_read_receipt(conn, &receipt))
            .await
    }

    pub async fn get_reads_for_message(&self, message_id: &str) -> StoreResult<Vec<ReadReceipt>> {
        let message_id = message_id.to_string();
        self.db
            .call(move |conn| queries::get_reads_for_message(conn, &message_id))
            .await
    }

    pub async fn get_reads_for_room(&self, room_id: &str) -> StoreResult<Vec<ReadReceipt>> {
        let room_id = room_id.to_string();
        self.db
            .call(move |conn| queries::get_reads_for_room(conn, &room_id))
            .await
    }

    // ==========================================
    // Media blobs
    // ==========================================

    pub async fn put_blob(&self, blob: NewMediaBlob) -> StoreResult<Merged<MediaBlob>> {
        self.db
            .call(move |conn| queries::merge_blob(conn, &blob))
            .await
    }

    pub async fn get_blob(&self, blob_ref: &str) -> StoreResult<Option<MediaBlob>> {
        let blob_ref = blob_ref.to_string();
        self.db
            .call(move |conn| queries::get_blob(conn, &blob_ref))
            .await
    }

    pub async fn delete_blob(&self, blob_ref: &str) -> StoreResult<bool> {
        let blob_ref = blob_ref.to_string();
        self.db
            .call(move |conn| queries::delete_blob(conn, &blob_ref))
            .await
    }

    // ==========================================
    // Outbox
    // ==========================================

    /// Stage an outbox item for a message that is awaiting delivery. An
    /// existing item for the cid is returned unchanged.
    pub async fn stage_outbox_item(
        &self,
        item: NewOutboxItem,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<Merged<OutboxItem>> {
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                if let Some(existing) = queries::get_outbox_item(&tx, &item.cid)? {
                    return Ok(Merged::existing(existing));
                }

                let message = queries::get_message_by_cid(&tx, &item.cid)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {}", item.cid)))?;
                if !message.status.awaits_delivery() {
                    return Err(StoreError::InvalidData(format!(
                        "message {} is {} and cannot be queued",
                        item.cid,
                        message.status.as_str()
                    )));
                }

                let staged = queries::insert_outbox_item(&tx, &item, &next_attempt_at)?;
                tx.commit()?;
                Ok(Merged::inserted(staged))
            })
            .await
    }

    /// Put a `failed` message back into `local` with a fresh outbox item.
    pub async fn restage_failed_message(
        &self,
        cid: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<OutboxItem> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let message = queries::get_message_by_cid(&tx, &cid)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {cid}")))?;
                if message.status != MessageStatus::Failed {
                    return Err(StoreError::InvalidData(format!(
                        "message {cid} is {}, only failed messages can be retried",
                        message.status.as_str()
                    )));
                }

                queries::set_message_status(&tx, &cid, MessageStatus::Local)?;
                let item = NewOutboxItem {
                    cid: cid.clone(),
                    room_id: message.room_id,
                    payload,
                    created_at: now,
                };
                let staged = queries::insert_outbox_item(&tx, &item, &now)?;
                tx.commit()?;
                info!(cid = %cid, "Failed message re-staged");
                Ok(staged)
            })
            .await
    }

    pub async fn get_outbox_item(&self, cid: &str) -> StoreResult<Option<OutboxItem>> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| queries::get_outbox_item(conn, &cid))
            .await
    }

    pub async fn list_outbox_items(&self) -> StoreResult<Vec<OutboxItem>> {
        self.db.call(queries::list_outbox_items).await
    }

    pub async fn due_outbox_items(&self, now: DateTime<Utc>) -> StoreResult<Vec<OutboxItem>> {
        self.db
            .call(move |conn| queries::due_outbox_items(conn, &now))
            .await
    }

    pub async fn outbox_items_at_or_past(&self, attempt: u32) -> StoreResult<Vec<OutboxItem>> {
        self.db
            .call(move |conn| queries::outbox_items_at_or_past(conn, attempt))
            .await
    }

    pub async fn outbox_len(&self) -> StoreResult<u64> {
        self.db.call(queries::count_outbox_items).await
    }

    /// Move a queued message to `sending`. Returns false if it was not `local`.
    pub async fn mark_sending(&self, cid: &str) -> StoreResult<bool> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                queries::swap_message_status(
                    conn,
                    &cid,
                    MessageStatus::Local,
                    MessageStatus::Sending,
                )
            })
            .await
    }

    /// Count a failed delivery attempt in one transaction.
    ///
    /// When the incremented attempt reaches `max_attempts` the item is
    /// abandoned and its message marked `failed`. Otherwise
    /// `schedule(attempt, previous_next_attempt_at)` picks the next attempt
    /// time and the message goes back to `local`. Returns `None` if nothing
    /// is queued for `cid`.
    pub async fn record_outbox_failure<F>(
        &self,
        cid: &str,
        error: String,
        max_attempts: u32,
        schedule: F,
    ) -> StoreResult<Option<OutboxFailure>>
    where
        F: FnOnce(u32, DateTime<Utc>) -> DateTime<Utc> + Send + 'static,
    {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let Some(item) = queries::get_outbox_item(&tx, &cid)? else {
                    return Ok(None);
                };

                let attempt = item.attempt.saturating_add(1);
                let outcome = if attempt >= max_attempts {
                    queries::delete_outbox_item(&tx, &cid)?;
                    if let Some(message) = queries::get_message_by_cid(&tx, &cid)? {
                        if message.status.awaits_delivery() {
                            queries::set_message_status(&tx, &cid, MessageStatus::Failed)?;
                        }
                    }
                    OutboxFailure::Abandoned { attempt }
                } else {
                    let next_attempt_at = schedule(attempt, item.next_attempt_at);
                    queries::update_outbox_attempt(
                        &tx,
                        &cid,
                        attempt,
                        &next_attempt_at,
                        Some(error.as_str()),
                    )?;
                    queries::swap_message_status(
                        &tx,
                        &cid,
                        MessageStatus::Sending,
                        MessageStatus::Local,
                    )?;
                    OutboxFailure::Rescheduled {
                        attempt,
                        next_attempt_at,
                    }
                };
                tx.commit()?;
                Ok(Some(outcome))
            })
            .await
    }

    /// Remove a delivered item and mark its message `ack`.
    ///
    /// Returns false if the item was already gone.
    pub async fn complete_outbox_item(&self, cid: &str) -> StoreResult<bool> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                if !queries::delete_outbox_item(&tx, &cid)? {
                    return Ok(false);
                }
                if let Some(message) = queries::get_message_by_cid(&tx, &cid)? {
                    if message.status.can_transition_to(MessageStatus::Ack) {
                        queries::set_message_status(&tx, &cid, MessageStatus::Ack)?;
                    }
                }
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    /// Remove an item that will not be retried and mark its message `failed`.
    ///
    /// Returns false if the item was already gone, so concurrent abandoners
    /// each observe exactly one success.
    pub async fn abandon_outbox_item(&self, cid: &str) -> StoreResult<bool> {
        let cid = cid.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                if !queries::delete_outbox_item(&tx, &cid)? {
                    return Ok(false);
                }
                if let Some(message) = queries::get_message_by_cid(&tx, &cid)? {
                    if message.status.awaits_delivery() {
                        queries::set_message_status(&tx, &cid, MessageStatus::Failed)?;
                    }
                }
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    // ==========================================
    // Retention
    // ==========================================

    /// Delete one page of messages older than `cutoff`, starting after `after`.
    pub async fn evict_message_page(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<MessageKey>,
        limit: usize,
    ) -> StoreResult<EvictionPage> {
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let page = queries::evict_message_page(&tx, &cutoff, after.as_ref(), limit)?;
                tx.commit()?;
                Ok(page)
            })
            .await
    }

    pub async fn storage_usage(&self) -> StoreResult<StorageUsage> {
        self.db.call(queries::storage_usage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MediaDescriptor, MessageContent};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn text_message(cid: &str, room_id: &str, secs: i64) -> NewMessage {
        NewMessage {
            cid: cid.to_string(),
            room_id: room_id.to_string(),
            sender_id: "user-1".to_string(),
            created_at: at(secs),
            content: MessageContent::text(format!("hello from {cid}")),
            reply_to: None,
            reactions: Default::default(),
        }
    }

    fn room(id: &str, secs: i64) -> NewRoom {
        NewRoom {
            id: id.to_string(),
            title: format!("Room {id}"),
            is_group: true,
            created_at: at(secs),
            last_message_at: None,
        }
    }

    async fn store() -> RecordStore {
        RecordStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_message_stages_outbox_item() {
        let store = store().await;
        let merged = store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({"cid": "c1"}), at(0))
            .await
            .unwrap();

        assert!(merged.inserted);
        assert_eq!(merged.record.status, MessageStatus::Local);
        assert_eq!(merged.record.cid, "c1");

        let item = store.get_outbox_item("c1").await.unwrap().unwrap();
        assert_eq!(item.attempt, 0);
        assert_eq!(item.next_attempt_at, at(0));
        assert_eq!(item.payload["cid"], "c1");
    }

    #[tokio::test]
    async fn test_create_message_is_idempotent_on_cid() {
        let store = store().await;
        let first = store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();
        let second = store
            .create_message(text_message("c1", "r1", 5), serde_json::json!({}), at(5))
            .await
            .unwrap();

        assert!(!second.inserted);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(store.get_messages_by_room("r1").await.unwrap().len(), 1);
        assert_eq!(store.outbox_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_cid_agree() {
        let store = store().await;
        let merged = store
            .insert_message(text_message("c1", "r1", 0), MessageStatus::Ack)
            .await
            .unwrap();

        let by_id = store.get_message(&merged.record.id).await.unwrap().unwrap();
        let by_cid = store.get_message_by_cid("c1").await.unwrap().unwrap();
        assert_eq!(by_id, by_cid);
        assert!(store.get_message_by_cid("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_message_rejects_delivery_status_without_outbox() {
        let store = store().await;
        let err = store
            .insert_message(text_message("c1", "r1", 0), MessageStatus::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_messages_by_room_are_time_ordered() {
        let store = store().await;
        for (cid, secs) in [("c3", 30), ("c1", 10), ("c2", 20)] {
            store
                .insert_message(text_message(cid, "r1", secs), MessageStatus::Ack)
                .await
                .unwrap();
        }
        store
            .insert_message(text_message("other", "r2", 15), MessageStatus::Ack)
            .await
            .unwrap();

        let cids: Vec<_> = store
            .get_messages_by_room("r1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.cid)
            .collect();
        assert_eq!(cids, vec!["c1", "c2", "c3"]);

        let page = store
            .get_messages_page("r1", Some(at(30)), 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].cid, "c2");
    }

    #[tokio::test]
    async fn test_status_transitions_keep_outbox_pairing() {
        let store = store().await;
        store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();

        assert!(store.mark_sending("c1").await.unwrap());
        assert!(store
            .update_message_status("c1", MessageStatus::Sent)
            .await
            .unwrap());
        assert!(store.get_outbox_item("c1").await.unwrap().is_some());

        assert!(store
            .update_message_status("c1", MessageStatus::Ack)
            .await
            .unwrap());
        assert!(store.get_outbox_item("c1").await.unwrap().is_none());

        // ack only moves to deleted
        assert!(!store
            .update_message_status("c1", MessageStatus::Failed)
            .await
            .unwrap());
        assert!(store.delete_message("c1").await.unwrap());
        assert!(!store
            .update_message_status("c1", MessageStatus::Ack)
            .await
            .unwrap());

        let stored = store.get_message_by_cid("c1").await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Deleted);
    }

    #[tokio::test]
    async fn test_update_status_back_into_delivery_requires_outbox_item() {
        let store = store().await;
        store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();
        store.abandon_outbox_item("c1").await.unwrap();

        let err = store
            .update_message_status("c1", MessageStatus::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        let missing = store
            .update_message_status("nope", MessageStatus::Ack)
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_and_abandon_are_exactly_once() {
        let store = store().await;
        for cid in ["ok", "bad"] {
            store
                .create_message(text_message(cid, "r1", 0), serde_json::json!({}), at(0))
                .await
                .unwrap();
        }

        assert!(store.complete_outbox_item("ok").await.unwrap());
        assert!(!store.complete_outbox_item("ok").await.unwrap());
        assert_eq!(
            store.get_message_by_cid("ok").await.unwrap().unwrap().status,
            MessageStatus::Ack
        );

        let (a, b) = tokio::join!(
            store.abandon_outbox_item("bad"),
            store.abandon_outbox_item("bad")
        );
        assert_eq!(
            [a.unwrap(), b.unwrap()].iter().filter(|done| **done).count(),
            1
        );
        assert_eq!(
            store.get_message_by_cid("bad").await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
        assert_eq!(store.outbox_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_reschedules_then_abandons() {
        let store = store().await;
        store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();
        store.mark_sending("c1").await.unwrap();

        let outcome = store
            .record_outbox_failure("c1", "timeout".to_string(), 3, |attempt, previous| {
                previous + chrono::Duration::seconds(2 * attempt as i64)
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Some(OutboxFailure::Rescheduled {
                attempt: 1,
                next_attempt_at: at(2)
            })
        );

        let item = store.get_outbox_item("c1").await.unwrap().unwrap();
        assert_eq!(item.attempt, 1);
        assert_eq!(item.last_error.as_deref(), Some("timeout"));
        assert_eq!(
            store.get_message_by_cid("c1").await.unwrap().unwrap().status,
            MessageStatus::Local
        );
        assert!(store.due_outbox_items(at(1)).await.unwrap().is_empty());
        assert_eq!(store.due_outbox_items(at(2)).await.unwrap().len(), 1);

        let schedule = |_: u32, previous: DateTime<Utc>| previous + chrono::Duration::seconds(1);
        store
            .record_outbox_failure("c1", "timeout".to_string(), 3, schedule)
            .await
            .unwrap();
        let last = store
            .record_outbox_failure("c1", "timeout".to_string(), 3, schedule)
            .await
            .unwrap();
        assert_eq!(last, Some(OutboxFailure::Abandoned { attempt: 3 }));
        assert!(store.get_outbox_item("c1").await.unwrap().is_none());
        assert_eq!(
            store.get_message_by_cid("c1").await.unwrap().unwrap().status,
            MessageStatus::Failed
        );

        let gone = store
            .record_outbox_failure("c1", "timeout".to_string(), 3, schedule)
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_restage_failed_message() {
        let store = store().await;
        store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();
        store.abandon_outbox_item("c1").await.unwrap();

        let item = store
            .restage_failed_message("c1", serde_json::json!({"retry": true}), at(60))
            .await
            .unwrap();
        assert_eq!(item.attempt, 0);
        assert_eq!(
            store.get_message_by_cid("c1").await.unwrap().unwrap().status,
            MessageStatus::Local
        );

        let err = store
            .restage_failed_message("c1", serde_json::json!({}), at(61))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_stage_outbox_item_requires_pending_message() {
        let store = store().await;
        store
            .insert_message(text_message("acked", "r1", 0), MessageStatus::Ack)
            .await
            .unwrap();

        let item = NewOutboxItem {
            cid: "acked".to_string(),
            room_id: "r1".to_string(),
            payload: serde_json::json!({}),
            created_at: at(0),
        };
        let err = store.stage_outbox_item(item, at(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));

        let orphan = NewOutboxItem {
            cid: "ghost".to_string(),
            room_id: "r1".to_string(),
            payload: serde_json::json!({}),
            created_at: at(0),
        };
        let err = store.stage_outbox_item(orphan, at(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_room_activity_is_monotonic() {
        let store = store().await;
        store.insert_room(room("r1", 0)).await.unwrap();

        store
            .insert_message(text_message("c2", "r1", 20), MessageStatus::Ack)
            .await
            .unwrap();
        store
            .insert_message(text_message("c1", "r1", 10), MessageStatus::Ack)
            .await
            .unwrap();
        assert!(!store.touch_room("r1", at(5)).await.unwrap());

        let stored = store.get_room("r1").await.unwrap().unwrap();
        assert_eq!(stored.last_message_at, Some(at(20)));

        let mut newer = room("r1", 0);
        newer.last_message_at = Some(at(40));
        let merged = store.insert_room(newer).await.unwrap();
        assert!(!merged.inserted);
        assert_eq!(merged.record.last_message_at, Some(at(40)));
    }

    #[tokio::test]
    async fn test_list_rooms_orders_by_activity() {
        let store = store().await;
        store.insert_room(room("quiet", 50)).await.unwrap();
        store.insert_room(room("old", 0)).await.unwrap();
        store.insert_room(room("busy", 1)).await.unwrap();
        store.touch_room("old", at(10)).await.unwrap();
        store.touch_room("busy", at(20)).await.unwrap();

        let ids: Vec<_> = store
            .list_rooms()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["busy", "old", "quiet"]);
    }

    #[tokio::test]
    async fn test_memberships() {
        let store = store().await;
        store.insert_room(room("r1", 0)).await.unwrap();
        let member = NewMembership {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            role: MemberRole::Member,
            joined_at: at(1),
        };

        assert!(store.add_member(member.clone()).await.unwrap().inserted);
        assert!(!store.add_member(member).await.unwrap().inserted);
        assert!(store
            .set_member_role("r1", "u1", MemberRole::Admin)
            .await
            .unwrap());

        let members = store.get_members("r1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, MemberRole::Admin);
        assert_eq!(store.get_rooms_for_user("u1").await.unwrap().len(), 1);

        assert!(store.remove_member("r1", "u1").await.unwrap());
        assert!(store.get_members("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_columns_are_reported_not_defaulted() {
        let store = store().await;
        store.insert_room(room("r1", 0)).await.unwrap();
        store
            .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
            .await
            .unwrap();
        store
            .insert_message(text_message("c2", "r1", 1), MessageStatus::Ack)
            .await
            .unwrap();
        store
            .add_member(NewMembership {
                room_id: "r1".to_string(),
                user_id: "u1".to_string(),
                role: MemberRole::Member,
                joined_at: at(1),
            })
            .await
            .unwrap();

        store
            .db
            .call_sqlite(|conn| {
                conn.execute("UPDATE messages SET status = 'bogus' WHERE cid = 'c1'", [])?;
                conn.execute(
                    "UPDATE messages SET created_at = ?1 WHERE cid = 'c2'",
                    [i64::MAX],
                )?;
                conn.execute("UPDATE memberships SET role = 'owner'", [])?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            store.get_message_by_cid("c1").await,
            Err(StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(5, ..)))
        ));
        assert!(matches!(
            store.get_message_by_cid("c2").await,
            Err(StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(4, ..)))
        ));
        assert!(matches!(
            store.get_members("r1").await,
            Err(StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(2, ..)))
        ));
    }

    #[tokio::test]
    async fn test_read_receipts_last_write_wins() {
        let store = store().await;
        let mut receipt = ReadReceipt {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            message_id: "m1".to_string(),
            read_at: at(10),
        };
        store.mark_read(receipt.clone()).await.unwrap();
        receipt.read_at = at(5);
        store.mark_read(receipt).await.unwrap();

        let reads = store.get_reads_for_message("m1").await.unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].read_at, at(5));
        assert_eq!(store.get_reads_for_room("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reactions() {
        let store = store().await;
        store
            .insert_message(text_message("c1", "r1", 0), MessageStatus::Ack)
            .await
            .unwrap();

        store.add_reaction("c1", "👍", "u1").await.unwrap();
        let message = store.add_reaction("c1", "👍", "u2").await.unwrap();
        assert_eq!(message.reactions["👍"].len(), 2);

        store.remove_reaction("c1", "👍", "u1").await.unwrap();
        let message = store.remove_reaction("c1", "👍", "u2").await.unwrap();
        assert!(message.reactions.is_empty());

        let stored = store.get_message_by_cid("c1").await.unwrap().unwrap();
        assert!(stored.reactions.is_empty());
    }

    #[tokio::test]
    async fn test_media_blob_and_descriptor() {
        let store = store().await;
        let blob = store
            .put_blob(NewMediaBlob {
                blob_ref: None,
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3, 4],
                created_at: at(0),
            })
            .await
            .unwrap()
            .record;

        let duplicate = store
            .put_blob(NewMediaBlob {
                blob_ref: Some(blob.blob_ref.clone()),
                mime_type: "image/png".to_string(),
                data: vec![9],
                created_at: at(1),
            })
            .await
            .unwrap();
        assert!(!duplicate.inserted);
        assert_eq!(duplicate.record.data, vec![1, 2, 3, 4]);

        let mut message = text_message("img", "r1", 0);
        message.content = MessageContent::Image(MediaDescriptor {
            blob_ref: Some(blob.blob_ref.clone()),
            url: None,
            file_name: "scan.png".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 4,
            duration_ms: None,
        });
        let stored = store
            .insert_message(message, MessageStatus::Ack)
            .await
            .unwrap()
            .record;
        assert_eq!(stored.content.blob_ref(), Some(blob.blob_ref.as_str()));

        let usage = store.storage_usage().await.unwrap();
        assert_eq!(usage.media_blobs, 1);
        assert_eq!(usage.media_bytes, 4);

        assert!(store.delete_blob(&blob.blob_ref).await.unwrap());
        assert!(store.get_blob(&blob.blob_ref).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_page_skips_undelivered_and_removes_reads() {
        let store = store().await;
        let old = store
            .insert_message(text_message("old", "r1", 0), MessageStatus::Ack)
            .await
            .unwrap()
            .record;
        store
            .create_message(text_message("pending", "r1", 1), serde_json::json!({}), at(1))
            .await
            .unwrap();
        store
            .insert_message(text_message("fresh", "r1", 100), MessageStatus::Ack)
            .await
            .unwrap();
        store
            .mark_read(ReadReceipt {
                room_id: "r1".to_string(),
                user_id: "u1".to_string(),
                message_id: old.id.clone(),
                read_at: at(2),
            })
            .await
            .unwrap();

        let page = store.evict_message_page(at(50), None, 10).await.unwrap();
        assert_eq!(page.scanned, 2);
        assert_eq!(page.deleted, 1);
        assert_eq!(page.last_key.as_ref().map(|k| k.created_at), Some(at(1)));

        let next = store
            .evict_message_page(at(50), page.last_key, 10)
            .await
            .unwrap();
        assert_eq!(next.scanned, 0);
        assert!(next.last_key.is_none());

        assert!(store.get_message_by_cid("old").await.unwrap().is_none());
        assert!(store.get_message_by_cid("pending").await.unwrap().is_some());
        assert!(store.get_reads_for_message(&old.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("carelink.sqlite");

        {
            let store = RecordStore::open(&path).await.unwrap();
            store
                .create_message(text_message("c1", "r1", 0), serde_json::json!({}), at(0))
                .await
                .unwrap();
            for _ in 0..2 {
                store
                    .record_outbox_failure("c1", "offline".to_string(), 5, |_, _| at(8))
                    .await
                    .unwrap();
            }
            store.close().await.unwrap();
        }

        let store = RecordStore::open(&path).await.unwrap();
        let item = store.get_outbox_item("c1").await.unwrap().unwrap();
        assert_eq!(item.attempt, 2);
        assert_eq!(item.next_attempt_at, at(8));
        assert_eq!(store.schema_version().await.unwrap(), migrations::latest_version());
    }
}
