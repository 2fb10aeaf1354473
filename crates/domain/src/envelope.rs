//! The normalized inbound envelope that channel connectors produce.
//!
//! An envelope is immutable once produced: the connector builds it from the
//! wire message, the router consumes it, and it is discarded after routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of conversation slot a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
    Room,
    Thread,
}

/// A conversation peer: the reply container for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
}

impl Peer {
    pub fn direct(id: impl Into<String>) -> Self {
        Self { kind: PeerKind::Direct, id: id.into() }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self { kind: PeerKind::Group, id: id.into() }
    }

    pub fn room(id: impl Into<String>) -> Self {
        Self { kind: PeerKind::Room, id: id.into() }
    }

    pub fn thread(id: impl Into<String>) -> Self {
        Self { kind: PeerKind::Thread, id: id.into() }
    }

    pub fn is_direct(&self) -> bool {
        self.kind == PeerKind::Direct
    }
}

/// An attachment reference carried on an envelope.  The core never opens
/// attachment payloads; it only needs their presence for debounce bypass
/// and delivery shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Normalized inbound message record.  Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Connector name: `"telegram"`, `"discord"`, `"matrix"`, etc.
    pub channel: String,
    /// Bot account ID within the connector.
    pub account_id: String,
    /// Raw sender ID (should be provider-prefixed: `telegram:123`).
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// The reply container.
    pub peer: Peer,
    /// For thread messages: the containing group/room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_peer: Option<Peer>,
    /// Space / server / guild ID (optional scoping, not the reply container).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    /// Team / workspace ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Raw user text.
    pub body: String,
    /// Platform-native message ID.
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_mention: bool,
    #[serde(default)]
    pub is_bot_self_reply: bool,
}

impl Envelope {
    /// Dedup identity: two envelopes with the same key within the dedup TTL
    /// produce at most one job.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.channel, self.account_id, self.peer.id, self.message_id
        )
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
