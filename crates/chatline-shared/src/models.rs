//! Entity types stored in the remote channel.
//!
//! Nodes arrive as untyped JSON. Every entity is decoded at the boundary
//! through [`decode`] (or [`Message::decode`]) and malformed nodes are
//! rejected rather than trusted.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{PHOTO_PREVIEW, VOICE_PREVIEW};
use crate::error::DecodeError;
use crate::types::{CallKind, ConversationId, MessageId, RoomId, UserId};

/// Decode a channel node into a typed entity.
pub fn decode<T: DeserializeOwned>(path: &str, value: &Value) -> Result<T, DecodeError> {
    serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Emoji → ids of the users who reacted with it. Stored as arrays.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Node key, assigned by the channel. Not part of the stored value.
    #[serde(skip)]
    pub id: MessageId,
    pub sender_id: UserId,
    /// Absent for group conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub text: String,
    /// URL into object storage, or an inline `data:` preview when the
    /// upload failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Client-assigned epoch millis at send time.
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: Reactions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
}

/// What a message renders as, in priority order image > text > audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageContent<'a> {
    Image(&'a str),
    Text(&'a str),
    Audio(&'a str),
}

impl Message {
    /// Decode a message node. Empty attachment strings are treated as absent
    /// and a node carrying no content at all is rejected.
    pub fn decode(key: &str, value: &Value) -> Result<Self, DecodeError> {
        let mut message: Message = decode(key, value)?;
        message.id = MessageId(key.to_string());
        message.image = message.image.filter(|s| !s.is_empty());
        message.audio = message.audio.filter(|s| !s.is_empty());
        if message.content().is_none() {
            return Err(DecodeError::EmptyMessage(key.to_string()));
        }
        Ok(message)
    }

    pub fn content(&self) -> Option<MessageContent<'_>> {
        if let Some(image) = self.image.as_deref() {
            Some(MessageContent::Image(image))
        } else if !self.text.trim().is_empty() {
            Some(MessageContent::Text(&self.text))
        } else {
            self.audio.as_deref().map(MessageContent::Audio)
        }
    }

    /// One-line preview used for the conversation list and push bodies.
    pub fn preview(&self) -> String {
        match self.content() {
            Some(MessageContent::Text(text)) => text.to_string(),
            Some(MessageContent::Image(_)) if !self.text.trim().is_empty() => self.text.clone(),
            Some(MessageContent::Image(_)) => PHOTO_PREVIEW.to_string(),
            Some(MessageContent::Audio(_)) => VOICE_PREVIEW.to_string(),
            None => String::new(),
        }
    }

    pub fn reactors(&self, emoji: &str) -> Option<&BTreeSet<UserId>> {
        self.reactions.get(emoji)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Snapshot of the message being replied to, captured at reply time. It is
/// not live-linked: later edits or deletes of the original do not touch it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplySnapshot {
    pub id: MessageId,
    pub text: String,
    pub sender_id: UserId,
}

impl ReplySnapshot {
    pub fn of(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            text: message.preview(),
            sender_id: message.sender_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Drafts
// ---------------------------------------------------------------------------

/// Raw attachment picked on the device, before upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub data: Bytes,
    pub content_type: String,
}

impl Attachment {
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    /// Inline `data:` URI of the attachment, used as the local preview and
    /// as the fallback when the upload fails.
    pub fn preview_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            STANDARD.encode(&self.data)
        )
    }
}

/// Contents of the compose box at the moment the user hits send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDraft {
    pub text: String,
    pub image: Option<Attachment>,
    pub audio: Option<Attachment>,
    pub reply_to: Option<ReplySnapshot>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn image(image: Attachment) -> Self {
        Self {
            image: Some(image),
            ..Default::default()
        }
    }

    pub fn with_reply(mut self, reply_to: ReplySnapshot) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image.is_none() && self.audio.is_none()
    }
}

// ---------------------------------------------------------------------------
// Per-viewer state
// ---------------------------------------------------------------------------

/// Per-viewer, per-conversation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /// Messages at or before this instant are hidden from this viewer only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cleared_timestamp: Option<i64>,
}

impl ChatSettings {
    pub fn is_visible(&self, message: &Message) -> bool {
        match self.last_cleared_timestamp {
            Some(cleared) => message.timestamp > cleared,
            None => true,
        }
    }
}

/// Ephemeral "is typing" node. Its existence is the signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    #[serde(default = "default_true")]
    pub is_typing: bool,
    pub timestamp: i64,
}

fn default_true() -> bool {
    true
}

impl TypingSignal {
    pub fn is_fresh(&self, now: i64, ttl_ms: i64) -> bool {
        self.is_typing && now - self.timestamp < ttl_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_seen: i64,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

// ---------------------------------------------------------------------------
// Conversations and users
// ---------------------------------------------------------------------------

/// Metadata kept next to a conversation for the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    #[serde(default)]
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sender_id: Option<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

/// A conversation as the client sees it: its id and everyone in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
}

impl Conversation {
    pub fn direct(local: &UserId, peer: &UserId) -> Self {
        Self {
            id: ConversationId::direct(local, peer),
            participants: vec![local.clone(), peer.clone()],
        }
    }

    pub fn group(id: impl Into<String>, members: Vec<UserId>) -> Self {
        Self {
            id: ConversationId::group(id),
            participants: members,
        }
    }

    /// Everyone except `local`.
    pub fn others<'a>(&'a self, local: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participants.iter().filter(move |p| *p != local)
    }

    /// The single receiver of a 1:1 conversation; `None` for groups.
    pub fn receiver(&self, local: &UserId) -> Option<UserId> {
        let mut others = self.others(local);
        match (others.next(), others.next()) {
            (Some(peer), None) if self.participants.len() == 2 => Some(peer.clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Call signaling
// ---------------------------------------------------------------------------

/// Ringing call written by the caller into the callee's inbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallInboxRecord {
    pub caller_id: UserId,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_photo: Option<String>,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub room_id: RoomId,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallResponseStatus {
    Accepted,
    Rejected,
}

/// Callee's answer, written into the caller's response slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallResponseRecord {
    pub status: CallResponseStatus,
    pub room_id: RoomId,
}
