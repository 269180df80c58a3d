//! Standalone query functions.
//!
//! Each function takes a `&Connection` as its first parameter so it can run
//! against a plain connection or inside a transaction. Multi-row invariants
//! (message + outbox pairing) are upheld by the callers in `store.rs`, which
//! wrap these in a single transaction.

use crate::{
    EvictionPage, MediaBlob, Membership, MemberRole, Merged, Message, MessageKey, MessageStatus,
    NewMediaBlob, NewMembership, NewMessage, NewOutboxItem, NewRoom, OutboxItem, Reactions,
    ReadReceipt, Room, StorageUsage, StoreError, StoreResult,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::debug;

pub(crate) fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        conversion_error(idx, Type::Integer, format!("timestamp {ms}ms is out of range"))
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<MessageStatus> {
    let raw: String = row.get(idx)?;
    MessageStatus::parse(&raw)
        .ok_or_else(|| conversion_error(idx, Type::Text, format!("unknown message status {raw:?}")))
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

// ==========================================
// Messages
// ==========================================

const MESSAGE_COLUMNS: &str =
    "id, cid, room_id, sender_id, created_at, status, kind, content, reply_to, reactions";

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let content: String = row.get(7)?;
    let reactions: String = row.get(9)?;
    Ok(Message {
        id: row.get(0)?,
        cid: row.get(1)?,
        room_id: row.get(2)?,
        sender_id: row.get(3)?,
        created_at: time_column(row, 4)?,
        status: status_column(row, 5)?,
        content: parse_json(7, &content)?,
        reply_to: row.get(8)?,
        reactions: parse_json(9, &reactions)?,
    })
}

/// Insert a message. Fails with [`StoreError::DuplicateKey`] if the cid exists.
pub fn insert_message(
    conn: &Connection,
    message: &NewMessage,
    status: MessageStatus,
) -> StoreResult<Message> {
    let id = ulid::Ulid::new().to_string();
    let content = serde_json::to_string(&message.content)?;
    let reactions = serde_json::to_string(&message.reactions)?;

    conn.execute(
        "INSERT INTO messages (id, cid, room_id, sender_id, created_at, status, kind, content, reply_to, reactions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            message.cid,
            message.room_id,
            message.sender_id,
            to_millis(&message.created_at),
            status.as_str(),
            message.content.kind().as_str(),
            content,
            message.reply_to,
            reactions,
        ],
    )
    .map_err(|e| StoreError::from_write(e, &message.cid))?;

    touch_room(conn, &message.room_id, &message.created_at)?;

    get_message(conn, &id)?
        .ok_or_else(|| StoreError::NotFound("Message not found after insert".to_string()))
}

/// Insert a message, treating an existing cid as success.
pub fn merge_message(
    conn: &Connection,
    message: &NewMessage,
    status: MessageStatus,
) -> StoreResult<Merged<Message>> {
    match insert_message(conn, message, status) {
        Ok(inserted) => Ok(Merged::inserted(inserted)),
        Err(StoreError::DuplicateKey(_)) => {
            let existing = get_message_by_cid(conn, &message.cid)?.ok_or_else(|| {
                StoreError::NotFound(format!("message {} vanished during merge", message.cid))
            })?;
            debug!(cid = %message.cid, "Message already stored");
            Ok(Merged::existing(existing))
        }
        Err(e) => Err(e),
    }
}

/// Get a message by its store-local id.
pub fn get_message(conn: &Connection, id: &str) -> StoreResult<Option<Message>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
    ))?;
    Ok(stmt.query_row(params![id], map_message).optional()?)
}

/// Get a message by its idempotency token.
pub fn get_message_by_cid(conn: &Connection, cid: &str) -> StoreResult<Option<Message>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE cid = ?1"
    ))?;
    Ok(stmt.query_row(params![cid], map_message).optional()?)
}

/// All messages in a room, oldest first.
pub fn get_messages_by_room(conn: &Connection, room_id: &str) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let messages = stmt
        .query_map(params![room_id], map_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// The `limit` newest messages created before `before`, returned oldest first.
pub fn get_messages_page(
    conn: &Connection,
    room_id: &str,
    before: Option<&DateTime<Utc>>,
    limit: usize,
) -> StoreResult<Vec<Message>> {
    let before = before.map(to_millis).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE room_id = ?1 AND created_at < ?2
         ORDER BY created_at DESC, id DESC LIMIT ?3"
    ))?;
    let mut messages = stmt
        .query_map(params![room_id, before, limit as i64], map_message)?
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}

pub fn get_messages_by_status(
    conn: &Connection,
    status: MessageStatus,
) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let messages = stmt
        .query_map(params![status.as_str()], map_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Unconditionally write a status. Transition rules live in `store.rs`.
pub fn set_message_status(
    conn: &Connection,
    cid: &str,
    status: MessageStatus,
) -> StoreResult<bool> {
    let updated = conn.execute(
        "UPDATE messages SET status = ?2 WHERE cid = ?1",
        params![cid, status.as_str()],
    )?;
    Ok(updated > 0)
}

/// Move a message from `from` to `to`; no-op if it is in any other status.
pub fn swap_message_status(
    conn: &Connection,
    cid: &str,
    from: MessageStatus,
    to: MessageStatus,
) -> StoreResult<bool> {
    let updated = conn.execute(
        "UPDATE messages SET status = ?3 WHERE cid = ?1 AND status = ?2",
        params![cid, from.as_str(), to.as_str()],
    )?;
    Ok(updated > 0)
}

pub fn set_reactions(conn: &Connection, cid: &str, reactions: &Reactions) -> StoreResult<bool> {
    let raw = serde_json::to_string(reactions)?;
    let updated = conn.execute(
        "UPDATE messages SET reactions = ?2 WHERE cid = ?1",
        params![cid, raw],
    )?;
    Ok(updated > 0)
}

// ==========================================
// Rooms
// ==========================================

const ROOM_COLUMNS: &str = "id, title, is_group, created_at, last_message_at";

fn map_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        title: row.get(1)?,
        is_group: row.get(2)?,
        created_at: time_column(row, 3)?,
        last_message_at: row
            .get::<_, Option<i64>>(4)?
            .map(|ms| from_millis(4, ms))
            .transpose()?,
    })
}

/// Insert a room. Fails with [`StoreError::DuplicateKey`] if the id exists.
pub fn insert_room(conn: &Connection, room: &NewRoom) -> StoreResult<Room> {
    conn.execute(
        "INSERT INTO rooms (id, title, is_group, created_at, last_message_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            room.id,
            room.title,
            room.is_group,
            to_millis(&room.created_at),
            room.last_message_at.as_ref().map(to_millis),
        ],
    )
    .map_err(|e| StoreError::from_write(e, &room.id))?;

    get_room(conn, &room.id)?
        .ok_or_else(|| StoreError::NotFound("Room not found after insert".to_string()))
}

/// Insert a room, treating an existing id as success. The existing room's
/// activity timestamp is advanced if the incoming one is newer.
pub fn merge_room(conn: &Connection, room: &NewRoom) -> StoreResult<Merged<Room>> {
    match insert_room(conn, room) {
        Ok(inserted) => Ok(Merged::inserted(inserted)),
        Err(StoreError::DuplicateKey(_)) => {
            if let Some(at) = &room.last_message_at {
                touch_room(conn, &room.id, at)?;
            }
            let existing = get_room(conn, &room.id)?.ok_or_else(|| {
                StoreError::NotFound(format!("room {} vanished during merge", room.id))
            })?;
            Ok(Merged::existing(existing))
        }
        Err(e) => Err(e),
    }
}

pub fn get_room(conn: &Connection, id: &str) -> StoreResult<Option<Room>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], map_room).optional()?)
}

/// Rooms by most recent activity; rooms without messages last.
pub fn list_rooms(conn: &Connection) -> StoreResult<Vec<Room>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROOM_COLUMNS} FROM rooms
         ORDER BY last_message_at IS NULL, last_message_at DESC, created_at DESC"
    ))?;
    let rooms = stmt
        .query_map([], map_room)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rooms)
}

/// Advance `last_message_at` to `at` unless it is already later.
pub fn touch_room(conn: &Connection, room_id: &str, at: &DateTime<Utc>) -> StoreResult<bool> {
    let at = to_millis(at);
    let updated = conn.execute(
        "UPDATE rooms SET last_message_at = ?2
         WHERE id = ?1 AND (last_message_at IS NULL OR last_message_at < ?2)",
        params![room_id, at],
    )?;
    Ok(updated > 0)
}

// ==========================================
// Memberships
// ==========================================

fn map_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        room_id: row.get(0)?,
        user_id: row.get(1)?,
        role: {
            let raw: String = row.get(2)?;
            MemberRole::parse(&raw).ok_or_else(|| {
                conversion_error(2, Type::Text, format!("unknown member role {raw:?}"))
            })?
        },
        joined_at: time_column(row, 3)?,
    })
}

pub fn insert_membership(conn: &Connection, member: &NewMembership) -> StoreResult<Membership> {
    let key = format!("{}/{}", member.room_id, member.user_id);
    conn.execute(
        "INSERT INTO memberships (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            member.room_id,
            member.user_id,
            member.role.as_str(),
            to_millis(&member.joined_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, &key))?;

    get_membership(conn, &member.room_id, &member.user_id)?
        .ok_or_else(|| StoreError::NotFound("Membership not found after insert".to_string()))
}

pub fn merge_membership(
    conn: &Connection,
    member: &NewMembership,
) -> StoreResult<Merged<Membership>> {
    match insert_membership(conn, member) {
        Ok(inserted) => Ok(Merged::inserted(inserted)),
        Err(StoreError::DuplicateKey(key)) => {
            let existing = get_membership(conn, &member.room_id, &member.user_id)?
                .ok_or_else(|| StoreError::NotFound(format!("membership {key} vanished")))?;
            Ok(Merged::existing(existing))
        }
        Err(e) => Err(e),
    }
}

pub fn get_membership(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
) -> StoreResult<Option<Membership>> {
    let mut stmt = conn.prepare_cached(
        "SELECT room_id, user_id, role, joined_at FROM memberships
         WHERE room_id = ?1 AND user_id = ?2",
    )?;
    Ok(stmt
        .query_row(params![room_id, user_id], map_membership)
        .optional()?)
}

pub fn get_members(conn: &Connection, room_id: &str) -> StoreResult<Vec<Membership>> {
    let mut stmt = conn.prepare_cached(
        "SELECT room_id, user_id, role, joined_at FROM memberships
         WHERE room_id = ?1 ORDER BY joined_at ASC, user_id ASC",
    )?;
    let members = stmt
        .query_map(params![room_id], map_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

pub fn get_rooms_for_user(conn: &Connection, user_id: &str) -> StoreResult<Vec<Room>> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.id, r.title, r.is_group, r.created_at, r.last_message_at
         FROM rooms r JOIN memberships m ON m.room_id = r.id
         WHERE m.user_id = ?1
         ORDER BY r.last_message_at IS NULL, r.last_message_at DESC, r.created_at DESC",
    )?;
    let rooms = stmt
        .query_map(params![user_id], map_room)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rooms)
}

pub fn set_member_role(
    conn: &Connection,
    room_id: &str,
    user_id: &str,
    role: MemberRole,
) -> StoreResult<bool> {
    let updated = conn.execute(
        "UPDATE memberships SET role = ?3 WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id, role.as_str()],
    )?;
    Ok(updated > 0)
}

pub fn delete_membership(conn: &Connection, room_id: &str, user_id: &str) -> StoreResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM memberships WHERE room_id = ?1 AND user_id = ?2",
        params![room_id, user_id],
    )?;
    Ok(deleted > 0)
}

// ==========================================
// Read receipts
// ==========================================

fn map_receipt(row: &Row<'_>) -> rusqlite::Result<ReadReceipt> {
    Ok(ReadReceipt {
        room_id: row.get(0)?,
        user_id: row.get(1)?,
        message_id: row.get(2)?,
        read_at: time_column(row, 3)?,
    })
}

/// Record a read receipt; a later write for the same key replaces it.
pub fn upsert_read_receipt(conn: &Connection, receipt: &ReadReceipt) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO read_receipts (room_id, user_id, message_id, read_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_id, user_id, message_id) DO UPDATE SET read_at = excluded.read_at",
        params![
            receipt.room_id,
            receipt.user_id,
            receipt.message_id,
            to_millis(&receipt.read_at),
        ],
    )?;
    Ok(())
}

pub fn get_reads_for_message(conn: &Connection, message_id: &str) -> StoreResult<Vec<ReadReceipt>> {
    let mut stmt = conn.prepare_cached(
        "SELECT room_id, user_id, message_id, read_at FROM read_receipts
         WHERE message_id = ?1 ORDER BY read_at ASC, user_id ASC",
    )?;
    let receipts = stmt
        .query_map(params![message_id], map_receipt)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(receipts)
}

pub fn get_reads_for_room(conn: &Connection, room_id: &str) -> StoreResult<Vec<ReadReceipt>> {
    let mut stmt = conn.prepare_cached(
        "SELECT room_id, user_id, message_id, read_at FROM read_receipts
         WHERE room_id = ?1 ORDER BY read_at ASC, user_id ASC",
    )?;
    let receipts = stmt
        .query_map(params![room_id], map_receipt)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(receipts)
}

// ==========================================
// Media blobs
// ==========================================

fn map_blob(row: &Row<'_>) -> rusqlite::Result<MediaBlob> {
    Ok(MediaBlob {
        blob_ref: row.get(0)?,
        mime_type: row.get(1)?,
        data: row.get(2)?,
        created_at: time_column(row, 3)?,
    })
}

pub fn insert_blob(conn: &Connection, blob: &NewMediaBlob) -> StoreResult<MediaBlob> {
    let blob_ref = blob
        .blob_ref
        .clone()
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    conn.execute(
        "INSERT INTO media_blobs (blob_ref, mime_type, data, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            blob_ref,
            blob.mime_type,
            blob.data,
            blob.data.len() as i64,
            to_millis(&blob.created_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, &blob_ref))?;

    get_blob(conn, &blob_ref)?
        .ok_or_else(|| StoreError::NotFound("Blob not found after insert".to_string()))
}

pub fn merge_blob(conn: &Connection, blob: &NewMediaBlob) -> StoreResult<Merged<MediaBlob>> {
    match insert_blob(conn, blob) {
        Ok(inserted) => Ok(Merged::inserted(inserted)),
        Err(StoreError::DuplicateKey(blob_ref)) => {
            let existing = get_blob(conn, &blob_ref)?
                .ok_or_else(|| StoreError::NotFound(format!("blob {blob_ref} vanished")))?;
            Ok(Merged::existing(existing))
        }
        Err(e) => Err(e),
    }
}

pub fn get_blob(conn: &Connection, blob_ref: &str) -> StoreResult<Option<MediaBlob>> {
    let mut stmt = conn.prepare_cached(
        "SELECT blob_ref, mime_type, data, created_at FROM media_blobs WHERE blob_ref = ?1",
    )?;
    Ok(stmt.query_row(params![blob_ref], map_blob).optional()?)
}

pub fn delete_blob(conn: &Connection, blob_ref: &str) -> StoreResult<bool> {
    let deleted = conn.execute(
        "DELETE FROM media_blobs WHERE blob_ref = ?1",
        params![blob_ref],
    )?;
    Ok(deleted > 0)
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str =
    "cid, room_id, payload, attempt, next_attempt_at, last_error, created_at";

fn map_outbox_item(row: &Row<'_>) -> rusqlite::Result<OutboxItem> {
    let payload: String = row.get(2)?;
    Ok(OutboxItem {
        cid: row.get(0)?,
        room_id: row.get(1)?,
        payload: parse_json(2, &payload)?,
        attempt: row.get(3)?,
        next_attempt_at: time_column(row, 4)?,
        last_error: row.get(5)?,
        created_at: time_column(row, 6)?,
    })
}

/// Insert an outbox item with `attempt = 0`.
pub fn insert_outbox_item(
    conn: &Connection,
    item: &NewOutboxItem,
    next_attempt_at: &DateTime<Utc>,
) -> StoreResult<OutboxItem> {
    let payload = serde_json::to_string(&item.payload)?;
    conn.execute(
        "INSERT INTO outbox_items (cid, room_id, payload, attempt, next_attempt_at, last_error, created_at)
         VALUES (?1, ?2, ?3, 0, ?4, NULL, ?5)",
        params![
            item.cid,
            item.room_id,
            payload,
            to_millis(next_attempt_at),
            to_millis(&item.created_at),
        ],
    )
    .map_err(|e| StoreError::from_write(e, &item.cid))?;

    get_outbox_item(conn, &item.cid)?
        .ok_or_else(|| StoreError::NotFound("Outbox item not found after insert".to_string()))
}

pub fn get_outbox_item(conn: &Connection, cid: &str) -> StoreResult<Option<OutboxItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items WHERE cid = ?1"
    ))?;
    Ok(stmt.query_row(params![cid], map_outbox_item).optional()?)
}

/// Every outbox item, oldest first.
pub fn list_outbox_items(conn: &Connection) -> StoreResult<Vec<OutboxItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items ORDER BY created_at ASC, cid ASC"
    ))?;
    let items = stmt
        .query_map([], map_outbox_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Items whose next attempt is due at `now`, oldest first.
pub fn due_outbox_items(conn: &Connection, now: &DateTime<Utc>) -> StoreResult<Vec<OutboxItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items
         WHERE next_attempt_at <= ?1
         ORDER BY created_at ASC, cid ASC"
    ))?;
    let items = stmt
        .query_map(params![to_millis(now)], map_outbox_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn outbox_items_at_or_past(conn: &Connection, attempt: u32) -> StoreResult<Vec<OutboxItem>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items WHERE attempt >= ?1 ORDER BY created_at ASC, cid ASC"
    ))?;
    let items = stmt
        .query_map(params![attempt], map_outbox_item)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn count_outbox_items(conn: &Connection) -> StoreResult<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox_items", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn update_outbox_attempt(
    conn: &Connection,
    cid: &str,
    attempt: u32,
    next_attempt_at: &DateTime<Utc>,
    last_error: Option<&str>,
) -> StoreResult<bool> {
    let updated = conn.execute(
        "UPDATE outbox_items SET attempt = ?2, next_attempt_at = ?3, last_error = ?4 WHERE cid = ?1",
        params![cid, attempt, to_millis(next_attempt_at), last_error],
    )?;
    Ok(updated > 0)
}

pub fn delete_outbox_item(conn: &Connection, cid: &str) -> StoreResult<bool> {
    let deleted = conn.execute("DELETE FROM outbox_items WHERE cid = ?1", params![cid])?;
    Ok(deleted > 0)
}

// ==========================================
// Retention
// ==========================================

/// Delete up to `limit` messages older than `cutoff`, walking the
/// (created_at, id) index after `after`. Messages that still have an
/// outbox item are skipped, and receipts of deleted messages go with them.
pub fn evict_message_page(
    conn: &Connection,
    cutoff: &DateTime<Utc>,
    after: Option<&MessageKey>,
    limit: usize,
) -> StoreResult<EvictionPage> {
    let (after_at, after_id) = match after {
        Some(key) => (to_millis(&key.created_at), key.id.clone()),
        None => (i64::MIN, String::new()),
    };

    let rows: Vec<(String, i64, bool)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT m.id, m.created_at,
                    EXISTS(SELECT 1 FROM outbox_items o WHERE o.cid = m.cid)
             FROM messages m
             WHERE m.created_at < ?1
               AND (m.created_at > ?2 OR (m.created_at = ?2 AND m.id > ?3))
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![to_millis(cutoff), after_at, after_id, limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut page = EvictionPage {
        scanned: rows.len(),
        ..EvictionPage::default()
    };

    for (id, _, has_outbox) in &rows {
        if *has_outbox {
            debug!(message_id = %id, "Skipping eviction of undelivered message");
            continue;
        }
        conn.execute(
            "DELETE FROM read_receipts WHERE message_id = ?1",
            params![id],
        )?;
        page.deleted += conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
    }

    page.last_key = rows
        .last()
        .map(|(id, created_at, _)| -> StoreResult<MessageKey> {
            Ok(MessageKey {
                created_at: from_millis(1, *created_at)?,
                id: id.clone(),
            })
        })
        .transpose()?;
    Ok(page)
}

pub fn storage_usage(conn: &Connection) -> StoreResult<StorageUsage> {
    let count = |sql: &str| -> StoreResult<u64> {
        let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(value.max(0) as u64)
    };

    Ok(StorageUsage {
        messages: count("SELECT COUNT(*) FROM messages")?,
        rooms: count("SELECT COUNT(*) FROM rooms")?,
        memberships: count("SELECT COUNT(*) FROM memberships")?,
        outbox_items: count("SELECT COUNT(*) FROM outbox_items")?,
        media_blobs: count("SELECT COUNT(*) FROM media_blobs")?,
        media_bytes: count("SELECT COALESCE(SUM(size_bytes), 0) FROM media_blobs")?,
        read_receipts: count("SELECT COUNT(*) FROM read_receipts")?,
    })
}
