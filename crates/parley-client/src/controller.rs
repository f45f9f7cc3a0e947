//! Endpoint controller: issues commands and folds replies and relay events
//! into the local views.
//!
//! Commands go out through a [`CommandSink`] tagged with a request id. The
//! matching `command_result` decides what happens locally: a success is
//! applied straight away, a stale-state failure on a call means the server
//! moved on and the endpoint waits for the event that explains it.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use parley_shared::error::{CommandFailure, ErrorKind};
use parley_shared::models::{Call, Message};
use parley_shared::protocol::{
    ClientCommand, CommandEnvelope, CommandReply, MessageDraft, MessageRead, RelayEvent,
};
use parley_shared::types::{CallId, CallType, ChatId, MessageId, RoomId, UserId};

use crate::error::ClientError;
use crate::state::{CallView, ChatView};

/// Anything that can carry a command to the server.
pub trait CommandSink {
    fn submit(&self, envelope: CommandEnvelope) -> Result<(), ClientError>;
}

/// What a `command_result` meant for the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The command succeeded and its result was applied.
    Completed { command: &'static str },
    /// The server's state moved on first. Local state is left for the next
    /// relay event to fix; nothing should be shown to the user.
    Resync { command: &'static str },
    /// The user may not do this. Show it, don't retry.
    PermissionDenied { command: &'static str, message: String },
    Failed { command: &'static str, failure: CommandFailure },
}

pub struct Controller<S: CommandSink> {
    sink: S,
    pub calls: CallView,
    pub chats: ChatView,
    pending: HashMap<String, ClientCommand>,
    next_request: u64,
}

impl<S: CommandSink> Controller<S> {
    pub fn new(sink: S, me: UserId) -> Self {
        Self {
            sink,
            calls: CallView::new(),
            chats: ChatView::new(me),
            pending: HashMap::new(),
            next_request: 0,
        }
    }

    pub fn me(&self) -> UserId {
        self.chats.me
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send a command, returning its request id.
    pub fn issue(&mut self, command: ClientCommand) -> Result<String, ClientError> {
        self.next_request += 1;
        let request_id = format!("r{}", self.next_request);
        debug!(request = %request_id, command = command.name(), "Issuing command");
        self.sink
            .submit(CommandEnvelope::new(Some(request_id.clone()), command.clone()))?;
        self.pending.insert(request_id.clone(), command);
        Ok(request_id)
    }

    // -- calls --------------------------------------------------------------

    pub fn start_call(
        &mut self,
        callee_id: UserId,
        call_type: CallType,
        chat_id: Option<ChatId>,
    ) -> Result<String, ClientError> {
        if self.calls.is_busy() {
            return Err(ClientError::Busy);
        }
        self.issue(ClientCommand::InitiateCall {
            callee_id,
            call_type,
            chat_id,
        })
    }

    pub fn accept_call(&mut self) -> Result<String, ClientError> {
        let call_id = self.incoming_call()?;
        self.issue(ClientCommand::AcceptCall { call_id })
    }

    pub fn reject_call(&mut self) -> Result<String, ClientError> {
        let call_id = self.incoming_call()?;
        self.issue(ClientCommand::RejectCall { call_id })
    }

    pub fn cancel_call(&mut self) -> Result<String, ClientError> {
        let call_id = self
            .calls
            .outgoing
            .as_ref()
            .map(|c| c.id)
            .ok_or(ClientError::NoCall("outgoing"))?;
        self.issue(ClientCommand::CancelCall { call_id })
    }

    pub fn end_call(&mut self) -> Result<String, ClientError> {
        let call_id = self
            .calls
            .active
            .as_ref()
            .map(|a| a.call_id)
            .ok_or(ClientError::NoCall("active"))?;
        self.issue(ClientCommand::EndCall { call_id })
    }

    /// Join the media room of the active call.
    pub fn join_call_room(&mut self) -> Result<String, ClientError> {
        let room_id = self.active_room()?;
        self.issue(ClientCommand::JoinCallRoom { room_id })
    }

    pub fn send_signal(&mut self, command: ClientCommand) -> Result<String, ClientError> {
        match &command {
            ClientCommand::Signal { room_id, .. } if Some(*room_id) == self.active_room().ok() => {
                self.issue(command)
            }
            ClientCommand::Signal { .. } => Err(ClientError::NoCall("active")),
            other => Err(ClientError::InvalidSignal(format!(
                "expected a signal command, got {}",
                other.name()
            ))),
        }
    }

    fn incoming_call(&self) -> Result<CallId, ClientError> {
        self.calls
            .incoming
            .as_ref()
            .map(|i| i.call_id)
            .ok_or(ClientError::NoCall("incoming"))
    }

    fn active_room(&self) -> Result<RoomId, ClientError> {
        self.calls
            .active
            .as_ref()
            .map(|a| a.room_id)
            .ok_or(ClientError::NoCall("active"))
    }

    // -- chats --------------------------------------------------------------

    pub fn join_chat(&mut self, chat_id: ChatId) -> Result<String, ClientError> {
        self.issue(ClientCommand::JoinChat { chat_id })
    }

    pub fn open_chat(&mut self, chat_id: ChatId) -> Result<String, ClientError> {
        self.issue(ClientCommand::OpenChat { chat_id })
    }

    pub fn send_text(&mut self, chat_id: ChatId, text: &str) -> Result<String, ClientError> {
        self.send(chat_id, MessageDraft::text(text))
    }

    pub fn send(&mut self, chat_id: ChatId, draft: MessageDraft) -> Result<String, ClientError> {
        self.issue(ClientCommand::SendMessage { chat_id, draft })
    }

    pub fn mark_read(&mut self, message_id: MessageId) -> Result<String, ClientError> {
        self.issue(ClientCommand::MarkRead { message_id })
    }

    pub fn react(&mut self, message_id: MessageId, emoji: &str) -> Result<String, ClientError> {
        self.issue(ClientCommand::React {
            message_id,
            emoji: emoji.to_string(),
        })
    }

    pub fn edit(&mut self, message_id: MessageId, content: &str) -> Result<String, ClientError> {
        self.issue(ClientCommand::EditMessage {
            message_id,
            content: content.to_string(),
        })
    }

    pub fn delete(&mut self, message_id: MessageId) -> Result<String, ClientError> {
        self.issue(ClientCommand::DeleteMessage { message_id })
    }

    pub fn typing(&mut self, chat_id: ChatId, started: bool) -> Result<String, ClientError> {
        if started {
            self.issue(ClientCommand::Typing { chat_id })
        } else {
            self.issue(ClientCommand::StopTyping { chat_id })
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Fold one relay event into local state. Only `command_result` frames
    /// produce an [`Outcome`].
    pub fn handle_event(&mut self, event: RelayEvent) -> Option<Outcome> {
        match event {
            RelayEvent::CommandResult(reply) => self.handle_reply(reply),
            other => {
                let changed = self.calls.apply(&other) | self.chats.apply(&other);
                if !changed {
                    debug!(event = other.name(), "Event left local state unchanged");
                }
                None
            }
        }
    }

    fn handle_reply(&mut self, reply: CommandReply) -> Option<Outcome> {
        let command = reply
            .request_id
            .as_ref()
            .and_then(|id| self.pending.remove(id))?;
        let name = command.name();

        if reply.ok {
            if let Err(e) = self.apply_success(&command, reply.data) {
                warn!(command = name, "Unreadable command result: {e}");
            }
            return Some(Outcome::Completed { command: name });
        }

        let failure = reply
            .error
            .unwrap_or_else(|| CommandFailure::new(ErrorKind::Internal, "missing error"));
        Some(classify(&command, failure))
    }

    fn apply_success(&mut self, command: &ClientCommand, data: Option<Value>) -> Result<(), ClientError> {
        match command {
            ClientCommand::InitiateCall { .. } => {
                let call: Call = parse(data)?;
                self.calls.outgoing_started(call);
            }
            ClientCommand::AcceptCall { .. } => {
                let call: Call = parse(data)?;
                self.calls.accepted_locally(&call);
            }
            ClientCommand::RejectCall { call_id }
            | ClientCommand::CancelCall { call_id }
            | ClientCommand::EndCall { call_id } => {
                self.calls.clear(*call_id);
            }
            ClientCommand::OpenChat { chat_id } => {
                let messages: Vec<Message> = parse(data)?;
                self.chats.load(*chat_id, messages);
            }
            ClientCommand::SendMessage { .. }
            | ClientCommand::React { .. }
            | ClientCommand::EditMessage { .. }
            | ClientCommand::DeleteMessage { .. } => {
                let message: Message = parse(data)?;
                self.chats.upsert(message);
            }
            ClientCommand::MarkRead { message_id } => {
                let read = MessageRead {
                    message_id: *message_id,
                    user_id: self.chats.me,
                };
                self.chats.apply(&RelayEvent::MessageRead(read));
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ClientError> {
    Ok(serde_json::from_value(data.unwrap_or(Value::Null))?)
}

fn classify(command: &ClientCommand, failure: CommandFailure) -> Outcome {
    let name = command.name();
    if command.is_call_command() && (failure.superseded || failure.is_stale_state()) {
        debug!(command = name, "Call moved on before our command: {failure}");
        return Outcome::Resync { command: name };
    }
    let moderates = matches!(
        command,
        ClientCommand::EditMessage { .. } | ClientCommand::DeleteMessage { .. }
    );
    if moderates && failure.kind == ErrorKind::Forbidden {
        return Outcome::PermissionDenied {
            command: name,
            message: failure.message,
        };
    }
    warn!(command = name, "Command failed: {failure}");
    Outcome::Failed {
        command: name,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use parley_shared::error::Rejection;
    use parley_shared::models::UserSummary;
    use parley_shared::protocol::{CallAccepted, CallRef, IncomingCall};
    use parley_shared::types::{CallStatus, MessageType};

    use crate::state::CallPhase;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<CommandEnvelope>>,
    }

    impl CommandSink for RecordingSink {
        fn submit(&self, envelope: CommandEnvelope) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn controller() -> Controller<RecordingSink> {
        Controller::new(RecordingSink::default(), UserId::new())
    }

    fn call(caller: UserId, callee: UserId, status: CallStatus) -> Call {
        Call {
            id: CallId::new(),
            caller,
            callee,
            call_type: CallType::Video,
            status,
            room_id: RoomId::new(),
            chat_id: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn ok(request: &str, data: impl serde::Serialize) -> RelayEvent {
        RelayEvent::CommandResult(CommandReply::success(
            Some(request.to_string()),
            Some(serde_json::to_value(data).unwrap()),
        ))
    }

    fn failed(request: &str, failure: CommandFailure) -> RelayEvent {
        RelayEvent::CommandResult(CommandReply::failure(Some(request.to_string()), failure))
    }

    fn summary(id: UserId) -> UserSummary {
        UserSummary {
            id,
            name: "Bob".into(),
            email: "bob@example.com".into(),
        }
    }

    #[test]
    fn test_outgoing_call_flow() {
        let mut c = controller();
        let bob = UserId::new();
        let request = c.start_call(bob, CallType::Video, None).unwrap();
        assert_eq!(c.sink().sent.lock().unwrap()[0].request_id.as_deref(), Some("r1"));

        let placed = call(c.me(), bob, CallStatus::Pending);
        assert_eq!(
            c.handle_event(ok(&request, &placed)),
            Some(Outcome::Completed { command: "initiate_call" })
        );
        assert_eq!(c.calls.phase, CallPhase::Calling);
        assert!(matches!(
            c.start_call(bob, CallType::Voice, None),
            Err(ClientError::Busy)
        ));

        c.handle_event(RelayEvent::CallAccepted(CallAccepted {
            call_id: placed.id,
            participant: summary(bob),
            call_type: CallType::Video,
            room_id: placed.room_id,
        }));
        assert_eq!(c.calls.phase, CallPhase::Connected);

        let join = c.join_call_room().unwrap();
        assert!(c.handle_event(ok(&join, &placed)).is_some());
        let hangup = c.end_call().unwrap();
        c.handle_event(ok(&hangup, &placed));
        assert_eq!(c.calls.phase, CallPhase::Ended);
    }

    #[test]
    fn test_lost_accept_race_resyncs() {
        let mut c = controller();
        let caller = UserId::new();
        let incoming = IncomingCall {
            call_id: CallId::new(),
            caller: summary(caller),
            call_type: CallType::Voice,
            room_id: RoomId::new(),
        };
        c.handle_event(RelayEvent::IncomingCall(incoming.clone()));
        let request = c.accept_call().unwrap();

        let failure = CommandFailure {
            kind: ErrorKind::InvalidTransition,
            message: Rejection {
                entity: "call".into(),
                id: incoming.call_id.to_string(),
                state: "ended".into(),
                command: "accept".into(),
                superseded: true,
            }
            .to_string(),
            superseded: true,
        };
        assert_eq!(
            c.handle_event(failed(&request, failure)),
            Some(Outcome::Resync { command: "accept_call" })
        );
        assert_eq!(c.calls.phase, CallPhase::Ringing);

        c.handle_event(RelayEvent::CallCancelled(CallRef {
            call_id: incoming.call_id,
        }));
        assert_eq!(c.calls.phase, CallPhase::Ended);
        assert!(matches!(c.accept_call(), Err(ClientError::NoCall("incoming"))));
    }

    #[test]
    fn test_edit_by_non_sender_is_permission_denied() {
        let mut c = controller();
        let request = c.edit(MessageId::new(), "hacked").unwrap();
        let outcome = c.handle_event(failed(
            &request,
            CommandFailure::new(ErrorKind::Forbidden, "only the sender may edit"),
        ));
        assert!(matches!(
            outcome,
            Some(Outcome::PermissionDenied { command: "edit_message", .. })
        ));
    }

    #[test]
    fn test_open_chat_and_send() {
        let mut c = controller();
        let me = c.me();
        let ada = UserId::new();
        let chat = ChatId::new();
        let now = Utc::now();
        let incoming = Message {
            id: MessageId::new(),
            chat_id: chat,
            sender: ada,
            message_type: MessageType::Text,
            content: "hi".into(),
            media_meta: None,
            reply_to: None,
            read_by: vec![ada],
            reactions: vec![],
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        c.handle_event(RelayEvent::NewMessage(incoming.clone()));
        assert_eq!(c.chats.unread(chat), 1);

        let open = c.open_chat(chat).unwrap();
        let mut read = incoming.clone();
        read.read_by.push(me);
        c.handle_event(ok(&open, vec![read]));
        assert_eq!(c.chats.unread(chat), 0);

        let send = c.send_text(chat, "hello").unwrap();
        let reply = Message {
            id: MessageId::new(),
            sender: me,
            content: "hello".into(),
            read_by: vec![me],
            created_at: now + chrono::Duration::seconds(1),
            ..incoming
        };
        c.handle_event(ok(&send, &reply));
        let contents: Vec<_> = c.chats.messages(chat).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
    }

    #[test]
    fn test_unknown_reply_is_ignored() {
        let mut c = controller();
        assert_eq!(c.handle_event(ok("r99", serde_json::json!({}))), None);
    }
}
