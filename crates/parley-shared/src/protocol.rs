//! Realtime wire protocol.
//!
//! Server → client frames are [`RelayEvent`]s serialized as
//! `{"event": "<name>", "data": {...}}`. Client → server frames are
//! [`CommandEnvelope`]s carrying a [`ClientCommand`] tagged by `"type"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandFailure;
use crate::models::{MediaMeta, Message, Presence, Reaction, UserSummary};
use crate::types::{CallId, CallType, ChatId, MessageId, MessageType, RoomId, UserId};

/// Every event the relay can deliver to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    IncomingCall(IncomingCall),
    CallAccepted(CallAccepted),
    CallRejected(CallRef),
    CallCancelled(CallRef),
    CallEnded(CallRef),

    NewMessage(Message),
    MessageRead(MessageRead),
    MessageReaction(MessageReaction),
    MessageEdited(Message),
    MessageDeleted(MessageDeleted),

    UserStatusChanged(Presence),

    /// Typing indicators are pass-through; the server keeps no state.
    Typing(TypingNotice),
    StopTyping(TypingNotice),
    UserJoined(RoomMembership),
    UserLeft(RoomMembership),

    /// Opaque media negotiation blob relayed between call room members.
    Signal(SignalRelay),

    /// Reply to a command, delivered only on the issuing connection.
    CommandResult(CommandReply),
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall(_) => "incoming_call",
            Self::CallAccepted(_) => "call_accepted",
            Self::CallRejected(_) => "call_rejected",
            Self::CallCancelled(_) => "call_cancelled",
            Self::CallEnded(_) => "call_ended",
            Self::NewMessage(_) => "new_message",
            Self::MessageRead(_) => "message_read",
            Self::MessageReaction(_) => "message_reaction",
            Self::MessageEdited(_) => "message_edited",
            Self::MessageDeleted(_) => "message_deleted",
            Self::UserStatusChanged(_) => "user_status_changed",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::Signal(_) => "signal",
            Self::CommandResult(_) => "command_result",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: UserSummary,
    pub call_type: CallType,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub call_id: CallId,
    pub participant: UserSummary,
    pub call_type: CallType,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReaction {
    pub message_id: MessageId,
    pub reaction: Reaction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembership {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalRelay {
    pub room_id: RoomId,
    pub from: UserId,
    pub payload: Value,
}

/// Content of a message about to be sent.
///
/// Either `content` or `media_meta` must be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub media_meta: Option<MediaMeta>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// Fields of a contact to save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactDraft {
    pub name: String,
    pub phone: String,
    pub email: String,
}

/// Partial contact update; absent fields keep their value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Commands an endpoint may issue over its relay connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Authenticate {
        token: String,
    },
    Ping,

    JoinChat {
        chat_id: ChatId,
    },
    LeaveChat {
        chat_id: ChatId,
    },
    JoinCallRoom {
        room_id: RoomId,
    },
    LeaveCallRoom {
        room_id: RoomId,
    },
    Typing {
        chat_id: ChatId,
    },
    StopTyping {
        chat_id: ChatId,
    },
    Signal {
        room_id: RoomId,
        #[serde(default)]
        to: Option<UserId>,
        payload: Value,
    },

    InitiateCall {
        callee_id: UserId,
        call_type: CallType,
        #[serde(default)]
        chat_id: Option<ChatId>,
    },
    AcceptCall {
        call_id: CallId,
    },
    RejectCall {
        call_id: CallId,
    },
    CancelCall {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },

    OpenChat {
        chat_id: ChatId,
    },
    SendMessage {
        chat_id: ChatId,
        draft: MessageDraft,
    },
    MarkRead {
        message_id: MessageId,
    },
    React {
        message_id: MessageId,
        emoji: String,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Ping => "ping",
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveChat { .. } => "leave_chat",
            Self::JoinCallRoom { .. } => "join_call_room",
            Self::LeaveCallRoom { .. } => "leave_call_room",
            Self::Typing { .. } => "typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::Signal { .. } => "signal",
            Self::InitiateCall { .. } => "initiate_call",
            Self::AcceptCall { .. } => "accept_call",
            Self::RejectCall { .. } => "reject_call",
            Self::CancelCall { .. } => "cancel_call",
            Self::EndCall { .. } => "end_call",
            Self::OpenChat { .. } => "open_chat",
            Self::SendMessage { .. } => "send_message",
            Self::MarkRead { .. } => "mark_read",
            Self::React { .. } => "react",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
        }
    }

    /// Commands that drive the call state machine.
    pub fn is_call_command(&self) -> bool {
        matches!(
            self,
            Self::InitiateCall { .. }
                | Self::AcceptCall { .. }
                | Self::RejectCall { .. }
                | Self::CancelCall { .. }
                | Self::EndCall { .. }
        )
    }
}

/// A command plus the optional id echoed back in its [`CommandReply`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    pub command: ClientCommand,
}

impl CommandEnvelope {
    pub fn new(request_id: Option<String>, command: ClientCommand) -> Self {
        Self {
            request_id,
            command,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    #[serde(default)]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
}

impl CommandReply {
    pub fn success(request_id: Option<String>, data: Option<Value>) -> Self {
        Self {
            request_id,
            ok: true,
            data,
            error: None,
        }
    }

    pub fn failure(request_id: Option<String>, failure: CommandFailure) -> Self {
        Self {
            request_id,
            ok: false,
            data: None,
            error: Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_event_frame_shape() {
        let call_id = CallId::new();
        let event = RelayEvent::CallEnded(CallRef { call_id });
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "call_ended");
        assert_eq!(json["data"]["callId"], call_id.to_string());
        assert_eq!(event.name(), "call_ended");
    }

    #[test]
    fn test_incoming_call_payload_keys() {
        let event = RelayEvent::IncomingCall(IncomingCall {
            call_id: CallId::new(),
            caller: UserSummary {
                id: UserId::new(),
                name: "Ada".into(),
                email: "ada@example.com".into(),
            },
            call_type: CallType::Video,
            room_id: RoomId::new(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["callType"], "video");
        assert_eq!(json["data"]["caller"]["name"], "Ada");
    }

    #[test]
    fn test_command_parses_from_client_json() {
        let call_id = CallId::new();
        let text = format!(
            r#"{{"requestId":"7","command":{{"type":"accept_call","callId":"{}"}}}}"#,
            call_id
        );
        let envelope = CommandEnvelope::from_json(&text).unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("7"));
        assert_eq!(envelope.command, ClientCommand::AcceptCall { call_id });
        assert!(envelope.command.is_call_command());
    }

    #[test]
    fn test_send_message_draft_uses_type_key() {
        let chat_id = ChatId::new();
        let text = format!(
            r#"{{"command":{{"type":"send_message","chatId":"{}","draft":{{"content":"hi","type":"text"}}}}}}"#,
            chat_id
        );
        let envelope = CommandEnvelope::from_json(&text).unwrap();
        match envelope.command {
            ClientCommand::SendMessage { draft, .. } => {
                assert_eq!(draft.content.as_deref(), Some("hi"));
                assert_eq!(draft.message_type, Some(MessageType::Text));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_failure_reply_round_trip() {
        let reply = CommandReply::failure(
            Some("1".into()),
            CommandFailure::new(ErrorKind::Forbidden, "not the sender"),
        );
        let text = RelayEvent::CommandResult(reply.clone()).to_json().unwrap();
        match RelayEvent::from_json(&text).unwrap() {
            RelayEvent::CommandResult(parsed) => assert_eq!(parsed, reply),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
