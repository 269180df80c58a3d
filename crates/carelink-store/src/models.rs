//! Record types for every stored kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Emoji to the set of user ids who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<String>>;

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Local,
    Sending,
    Sent,
    Ack,
    Failed,
    Deleted,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Local
    }
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Ack => "ack",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "ack" => Some(Self::Ack),
            "failed" => Some(Self::Failed),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Statuses that must be paired with exactly one outbox item.
    pub fn awaits_delivery(&self) -> bool {
        matches!(self, Self::Local | Self::Sending | Self::Sent)
    }

    /// Whether a stored status may be replaced by `next`.
    ///
    /// `ack` only moves to `deleted`; `deleted` never moves.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        match self {
            Self::Deleted => false,
            Self::Ack => next == Self::Deleted,
            _ => true,
        }
    }
}

/// Message kind, derived from the content variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Voice,
    Video,
    Medical,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::Medical => "medical",
            Self::System => "system",
        }
    }
}

/// Reference to a media payload, stored locally as a blob or remotely by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Playback length for voice and video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Structured medical-case fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalRecord {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_ref: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Kind-specific message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageContent {
    Text { text: String },
    Image(MediaDescriptor),
    File(MediaDescriptor),
    Voice(MediaDescriptor),
    Video(MediaDescriptor),
    Medical(MedicalRecord),
    System { text: String },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image(_) => MessageKind::Image,
            Self::File(_) => MessageKind::File,
            Self::Voice(_) => MessageKind::Voice,
            Self::Video(_) => MessageKind::Video,
            Self::Medical(_) => MessageKind::Medical,
            Self::System { .. } => MessageKind::System,
        }
    }

    /// Local blob referenced by this content, if any.
    pub fn blob_ref(&self) -> Option<&str> {
        match self {
            Self::Image(m) | Self::File(m) | Self::Voice(m) | Self::Video(m) => {
                m.blob_ref.as_deref()
            }
            _ => None,
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-local primary key.
    pub id: String,
    /// Client idempotency token.
    pub cid: String,
    pub room_id: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub content: MessageContent,
    pub reply_to: Option<String>,
    pub reactions: Reactions,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }
}

/// Data needed to insert a message. Also the wire shape exchanged with the
/// chat server and the realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub cid: String,
    pub room_id: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Reactions::is_empty")]
    pub reactions: Reactions,
}

impl NewMessage {
    /// A locally composed message with a fresh idempotency token.
    pub fn compose(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: MessageContent,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cid: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            created_at,
            content,
            reply_to: None,
            reactions: Reactions::new(),
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// A conversation room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub title: String,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Data needed to insert a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoom {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Role of a user within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
}

impl Default for MemberRole {
    fn default() -> Self {
        Self::Member
    }
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Room membership, keyed by (room_id, user_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub room_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// Data needed to insert a membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMembership {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

/// A pending server write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub cid: String,
    pub room_id: String,
    /// Request body, opaque to the queue.
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Data needed to stage an outbox item.
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
    pub cid: String,
    pub room_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// What a failed delivery attempt did to its outbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxFailure {
    /// The item stays queued with a later `next_attempt_at`.
    Rescheduled {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The retry ceiling was reached; the item is gone and the message failed.
    Abandoned { attempt: u32 },
}

/// A locally stored binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub blob_ref: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Data needed to store a blob. `blob_ref` is assigned when `None`.
#[derive(Debug, Clone)]
pub struct NewMediaBlob {
    pub blob_ref: Option<String>,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Marks that a user has read a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub room_id: String,
    pub user_id: String,
    pub message_id: String,
    pub read_at: DateTime<Utc>,
}

/// Result of an insert keyed by a unique token.
///
/// `inserted` is false when a record with the same key already existed and
/// `record` is that existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged<T> {
    pub record: T,
    pub inserted: bool,
}

impl<T> Merged<T> {
    pub fn inserted(record: T) -> Self {
        Self {
            record,
            inserted: true,
        }
    }

    pub fn existing(record: T) -> Self {
        Self {
            record,
            inserted: false,
        }
    }
}

/// Position in the (created_at, id) message index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

/// Outcome of deleting one page of expired messages.
#[derive(Debug, Clone, Default)]
pub struct EvictionPage {
    /// Rows examined in this page, including those skipped.
    pub scanned: usize,
    pub deleted: usize,
    /// Key of the last row examined; `None` once the range is exhausted.
    pub last_key: Option<MessageKey>,
}

/// Row counts per record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub messages: u64,
    pub rooms: u64,
    pub memberships: u64,
    pub outbox_items: u64,
    pub media_blobs: u64,
    pub media_bytes: u64,
    pub read_receipts: u64,
}
