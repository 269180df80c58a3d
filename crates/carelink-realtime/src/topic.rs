//! Subscription topics.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Messages,
    Rooms,
    Members,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Rooms => "rooms",
            Self::Members => "members",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Room(String),
}

/// What a subscription listens to. Its [`key`](Topic::key) identifies the
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: EntityKind,
    pub scope: Scope,
}

impl Topic {
    pub fn messages(room_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Messages,
            scope: Scope::Room(room_id.into()),
        }
    }

    pub fn rooms() -> Self {
        Self {
            kind: EntityKind::Rooms,
            scope: Scope::Global,
        }
    }

    pub fn members(room_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Members,
            scope: Scope::Room(room_id.into()),
        }
    }

    pub fn key(&self) -> String {
        match &self.scope {
            Scope::Global => format!("{}:global", self.kind.as_str()),
            Scope::Room(room_id) => format!("{}:room:{}", self.kind.as_str(), room_id),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
