//! Reconciling local views with relay events.
//!
//! Events always win over what the endpoint assumed locally, but an event
//! only touches state it names: a `call_ended` for some other call leaves
//! the current one alone, and a stale `call_accepted` is dropped.

use tracing::debug;

use parley_shared::constants::DELETED_MESSAGE_TOMBSTONE;
use parley_shared::protocol::RelayEvent;

use crate::state::{ActiveCall, CallPhase, CallView, ChatView};

impl CallView {
    /// Apply one event. Returns true if the view changed.
    pub fn apply(&mut self, event: &RelayEvent) -> bool {
        match event {
            RelayEvent::IncomingCall(incoming) => {
                if self.is_busy() {
                    debug!(call = %incoming.call_id, "Busy, leaving incoming call unanswered");
                    return false;
                }
                self.incoming = Some(incoming.clone());
                self.phase = CallPhase::Ringing;
                true
            }
            RelayEvent::CallAccepted(accepted) => {
                if self.outgoing.as_ref().map(|c| c.id) != Some(accepted.call_id) {
                    debug!(call = %accepted.call_id, "Ignoring call_accepted for unknown call");
                    return false;
                }
                self.outgoing = None;
                self.active = Some(ActiveCall {
                    call_id: accepted.call_id,
                    room_id: accepted.room_id,
                    peer: accepted.participant.id,
                    call_type: accepted.call_type,
                    outgoing: true,
                });
                self.phase = CallPhase::Connected;
                true
            }
            RelayEvent::CallRejected(r) | RelayEvent::CallCancelled(r) | RelayEvent::CallEnded(r) => {
                self.clear(r.call_id)
            }
            _ => false,
        }
    }
}

impl ChatView {
    /// Apply one event. Returns true if the view changed.
    pub fn apply(&mut self, event: &RelayEvent) -> bool {
        match event {
            RelayEvent::NewMessage(message) => {
                let me = self.me;
                if let Some(typing) = self.typing.get_mut(&message.chat_id) {
                    typing.remove(&message.sender);
                }
                let counts = message.sender != me && !message.is_read_by(&me);
                let chat = message.chat_id;
                let inserted = self.upsert(message.clone());
                if inserted && counts {
                    *self.unread.entry(chat).or_default() += 1;
                }
                inserted
            }
            RelayEvent::MessageRead(read) => {
                let me = self.me;
                let Some(message) = self.find_mut(read.message_id) else {
                    return false;
                };
                if message.is_read_by(&read.user_id) {
                    return false;
                }
                message.read_by.push(read.user_id);
                if read.user_id == me && message.sender != me {
                    let chat = message.chat_id;
                    if let Some(count) = self.unread.get_mut(&chat) {
                        *count = count.saturating_sub(1);
                    }
                }
                true
            }
            RelayEvent::MessageReaction(reaction) => {
                let Some(message) = self.find_mut(reaction.message_id) else {
                    return false;
                };
                message
                    .reactions
                    .retain(|r| r.user_id != reaction.reaction.user_id);
                message.reactions.push(reaction.reaction.clone());
                true
            }
            RelayEvent::MessageEdited(edited) => {
                let Some(message) = self.find_mut(edited.id) else {
                    return false;
                };
                if message.is_deleted {
                    return false;
                }
                message.content = edited.content.clone();
                message.is_edited = true;
                message.updated_at = edited.updated_at;
                true
            }
            RelayEvent::MessageDeleted(deleted) => {
                let Some(message) = self.find_mut(deleted.message_id) else {
                    return false;
                };
                if message.is_deleted {
                    return false;
                }
                message.is_deleted = true;
                message.content = DELETED_MESSAGE_TOMBSTONE.to_string();
                true
            }
            RelayEvent::UserStatusChanged(presence) => {
                self.presence.insert(presence.user_id, presence.clone());
                true
            }
            RelayEvent::Typing(notice) if notice.user_id != self.me => self
                .typing
                .entry(notice.chat_id)
                .or_default()
                .insert(notice.user_id),
            RelayEvent::StopTyping(notice) => self
                .typing
                .get_mut(&notice.chat_id)
                .is_some_and(|t| t.remove(&notice.user_id)),
            _ => false,
        }
    }
}
