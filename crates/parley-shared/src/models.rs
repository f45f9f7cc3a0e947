//! Domain records persisted by `parley-store` and carried over the wire.
//!
//! Every struct serializes with camelCase keys, which is the shape endpoints
//! receive in relay events and REST responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    CallId, CallOutcome, CallStatus, CallType, ChatId, ContactId, MessageId, MessageType, RoomId,
    UserId,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A principal known to the system, with its last persisted presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// The `{id, name, email}` triple embedded in call events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

/// Presence as broadcast in `user_status_changed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// An entry in `owner`'s saved contact list. The email (stored lowercase)
/// links it to a registered principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub owner: UserId,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A saved contact together with the principal its email resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactEntry {
    #[serde(flatten)]
    pub contact: Contact,
    pub user: Option<UserSummary>,
}

/// A principal found by email search, flagged if already saved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactMatch {
    pub user: UserSummary,
    pub is_saved: bool,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation between two or more principals.
///
/// `participants` is kept sorted so that equal sets compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub participants: Vec<UserId>,
    pub is_group: bool,
    pub name: Option<String>,
    pub admin: Option<UserId>,
    pub last_message: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    pub fn others(&self, user: &UserId) -> impl Iterator<Item = &UserId> + '_ {
        let user = *user;
        self.participants.iter().filter(move |p| **p != user)
    }
}

/// Summary of a chat's newest message as seen by one reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageSummary {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: UserId,
    pub is_read: bool,
}

/// Chat list entry returned to one principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub unread_count: u64,
    pub last_message_summary: Option<LastMessageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub chat_id: ChatId,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Attachment metadata for non-text messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MediaMeta {
    pub url: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
}

/// A chat message together with its read receipts and reactions.
///
/// `read_by` only grows; `is_edited` and `is_deleted` only turn true. A
/// deleted message keeps its `media_meta` for audit but consumers must not
/// render it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub media_meta: Option<MediaMeta>,
    pub reply_to: Option<MessageId>,
    pub read_by: Vec<UserId>,
    pub reactions: Vec<Reaction>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains(user)
    }

    /// Media that may be shown to users; `None` once the message is deleted.
    pub fn visible_media(&self) -> Option<&MediaMeta> {
        if self.is_deleted {
            None
        } else {
            self.media_meta.as_ref()
        }
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// Authoritative call record. `status` only moves forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub room_id: RoomId,
    /// Weak reference; validated at the boundary, never owned.
    pub chat_id: Option<ChatId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn is_party(&self, user: &UserId) -> bool {
        self.caller == *user || self.callee == *user
    }

    pub fn peer_of(&self, user: &UserId) -> Option<UserId> {
        if self.caller == *user {
            Some(self.callee)
        } else if self.callee == *user {
            Some(self.caller)
        } else {
            None
        }
    }
}

/// Audit row written alongside a call's transitions; one per attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: uuid::Uuid,
    pub call_id: CallId,
    pub chat_id: Option<ChatId>,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    pub outcome: CallOutcome,
    pub duration_secs: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallLog {
    /// Whole seconds between start and `ended_at`, floored at zero.
    pub fn duration_until(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
        (ended_at - started_at).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_duration_is_floored_at_zero() {
        let start = Utc::now();
        assert_eq!(CallLog::duration_until(start, start - Duration::seconds(5)), 0);
        assert_eq!(
            CallLog::duration_until(start, start + Duration::milliseconds(2_900)),
            2
        );
    }

    #[test]
    fn test_message_serializes_type_key() {
        let now = Utc::now();
        let msg = Message {
            id: MessageId::new(),
            chat_id: ChatId::new(),
            sender: UserId::new(),
            message_type: MessageType::Image,
            content: String::new(),
            media_meta: Some(MediaMeta {
                url: "/uploads/cat.png".into(),
                ..Default::default()
            }),
            reply_to: None,
            read_by: vec![],
            reactions: vec![],
            is_edited: false,
            is_deleted: true,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["isDeleted"], true);
        assert!(msg.visible_media().is_none());
    }

    #[test]
    fn test_peer_of() {
        let now = Utc::now();
        let call = Call {
            id: CallId::new(),
            caller: UserId::new(),
            callee: UserId::new(),
            call_type: CallType::Voice,
            status: CallStatus::Pending,
            room_id: RoomId::new(),
            chat_id: None,
            started_at: now,
            ended_at: None,
        };
        assert_eq!(call.peer_of(&call.caller), Some(call.callee));
        assert_eq!(call.peer_of(&UserId::new()), None);
    }
}
