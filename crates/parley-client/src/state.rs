//! Local mirrors of server state held by one endpoint.
//!
//! Both views only ever move toward what the server reports: relay events
//! are applied in [`crate::events`], successful command replies here.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use parley_shared::models::{Call, Message, Presence, UnreadCount};
use parley_shared::protocol::IncomingCall;
use parley_shared::types::{CallId, CallType, ChatId, MessageId, RoomId, UserId};

/// What the endpoint's call UI is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    /// Outgoing call ringing at the callee.
    Calling,
    /// Incoming call waiting for an answer.
    Ringing,
    Connected,
    /// The last call finished; the UI has not dismissed it yet.
    Ended,
}

/// A call both parties agreed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub call_id: CallId,
    pub room_id: RoomId,
    pub peer: UserId,
    pub call_type: CallType,
    pub outgoing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub phase: CallPhase,
    pub incoming: Option<IncomingCall>,
    pub outgoing: Option<Call>,
    pub active: Option<ActiveCall>,
}

impl Default for CallView {
    fn default() -> Self {
        Self::new()
    }
}

impl CallView {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            incoming: None,
            outgoing: None,
            active: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.incoming.is_some() || self.outgoing.is_some() || self.active.is_some()
    }

    /// The call id a hang-up applies to, whatever side we are on.
    pub fn current_call(&self) -> Option<CallId> {
        self.active
            .as_ref()
            .map(|a| a.call_id)
            .or_else(|| self.outgoing.as_ref().map(|c| c.id))
            .or_else(|| self.incoming.as_ref().map(|i| i.call_id))
    }

    /// Our `initiate_call` succeeded.
    pub(crate) fn outgoing_started(&mut self, call: Call) {
        self.outgoing = Some(call);
        self.phase = CallPhase::Calling;
    }

    /// Our `accept_call` succeeded.
    pub(crate) fn accepted_locally(&mut self, call: &Call) {
        if self.incoming.as_ref().map(|i| i.call_id) != Some(call.id) {
            return;
        }
        self.incoming = None;
        self.active = Some(ActiveCall {
            call_id: call.id,
            room_id: call.room_id,
            peer: call.caller,
            call_type: call.call_type,
            outgoing: false,
        });
        self.phase = CallPhase::Connected;
    }

    /// Drop everything about `call_id`. Returns false if it was not known.
    pub(crate) fn clear(&mut self, call_id: CallId) -> bool {
        let mut cleared = false;
        if self.incoming.as_ref().is_some_and(|i| i.call_id == call_id) {
            self.incoming = None;
            cleared = true;
        }
        if self.outgoing.as_ref().is_some_and(|c| c.id == call_id) {
            self.outgoing = None;
            cleared = true;
        }
        if self.active.as_ref().is_some_and(|a| a.call_id == call_id) {
            self.active = None;
            cleared = true;
        }
        if cleared && !self.is_busy() {
            self.phase = CallPhase::Ended;
        }
        cleared
    }

    /// The UI dismissed the ended call.
    pub fn acknowledge_ended(&mut self) {
        if self.phase == CallPhase::Ended {
            self.phase = CallPhase::Idle;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatView {
    pub(crate) me: UserId,
    pub(crate) messages: HashMap<ChatId, Vec<Message>>,
    pub(crate) unread: HashMap<ChatId, u64>,
    pub(crate) typing: HashMap<ChatId, BTreeSet<UserId>>,
    pub(crate) presence: HashMap<UserId, Presence>,
}

impl ChatView {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            ..Default::default()
        }
    }

    pub fn messages(&self, chat: ChatId) -> &[Message] {
        self.messages.get(&chat).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn unread(&self, chat: ChatId) -> u64 {
        self.unread.get(&chat).copied().unwrap_or(0)
    }

    pub fn unread_total(&self) -> u64 {
        self.unread.values().sum()
    }

    pub fn typing(&self, chat: ChatId) -> impl Iterator<Item = &UserId> + '_ {
        self.typing.get(&chat).into_iter().flatten()
    }

    pub fn presence(&self, user: UserId) -> Option<&Presence> {
        self.presence.get(&user)
    }

    pub fn find(&self, id: MessageId) -> Option<&Message> {
        self.messages.values().flatten().find(|m| m.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.values_mut().flatten().find(|m| m.id == id)
    }

    /// Replace a chat's messages with what `open_chat` returned. The unread
    /// count is recomputed from the receipts in the returned list.
    pub(crate) fn load(&mut self, chat: ChatId, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.created_at);
        let me = self.me;
        let unread = messages
            .iter()
            .filter(|m| m.sender != me && !m.is_read_by(&me))
            .count() as u64;
        self.messages.insert(chat, messages);
        self.unread.insert(chat, unread);
    }

    /// Insert or replace one message, keeping creation order.
    pub(crate) fn upsert(&mut self, message: Message) -> bool {
        let list = self.messages.entry(message.chat_id).or_default();
        if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return false;
        }
        let at = list.partition_point(|m| m.created_at <= message.created_at);
        list.insert(at, message);
        true
    }

    pub fn set_unread_counts(&mut self, counts: &[UnreadCount]) {
        for count in counts {
            self.unread.insert(count.chat_id, count.count);
        }
    }
}
