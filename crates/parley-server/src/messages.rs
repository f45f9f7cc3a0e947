//! Message delivery manager.
//!
//! Chats and their messages. A message's read-by set only grows and its
//! edited/deleted flags only turn true; every write to one message id goes
//! through that id's lock.

use chrono::Utc;
use tracing::{debug, info};

use parley_shared::constants::{DELETED_MESSAGE_TOMBSTONE, MAX_EMOJI_BYTES};
use parley_shared::error::Rejection;
use parley_shared::models::{
    Chat, ChatSummary, LastMessageSummary, Message, Reaction, UnreadCount,
};
use parley_shared::protocol::{
    MessageDeleted, MessageDraft, MessageRead, MessageReaction, RelayEvent, TypingNotice,
};
use parley_shared::types::{Channel, ChatId, MessageId, MessageType, UserId};
use parley_store::StoreError;

use crate::error::{OrNotFound, ServerError};
use crate::locks::KeyedLocks;
use crate::relay::{ConnectionId, EventRelay};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct MessageDeliveryManager {
    store: StoreHandle,
    relay: EventRelay,
    locks: KeyedLocks<MessageId>,
}

impl MessageDeliveryManager {
    pub fn new(store: StoreHandle, relay: EventRelay) -> Self {
        Self {
            store,
            relay,
            locks: KeyedLocks::new(),
        }
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Find or create the chat with exactly `creator` plus `participants`.
    /// The flag is true when a new chat was created.
    pub async fn create_chat(
        &self,
        creator: UserId,
        participants: Vec<UserId>,
        name: Option<String>,
    ) -> Result<(Chat, bool), ServerError> {
        let mut members = participants;
        members.push(creator);
        members.sort();
        members.dedup();
        if members.len() < 2 {
            return Err(ServerError::Validation(
                "a chat needs at least one other participant".into(),
            ));
        }

        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        let (chat, created) = self.store.with(|db| -> Result<_, ServerError> {
            for member in &members {
                if !db.user_exists(*member)? {
                    return Err(ServerError::Validation(format!("unknown participant {member}")));
                }
            }

            Ok(db.in_transaction(|db| {
                if let Some(existing) = db.find_chat_by_participants(&members)? {
                    return Ok((existing, false));
                }

                let now = Utc::now();
                let is_group = members.len() > 2;
                let chat = Chat {
                    id: ChatId::new(),
                    participants: members.clone(),
                    is_group,
                    name,
                    admin: is_group.then_some(creator),
                    last_message: None,
                    created_at: now,
                    updated_at: now,
                };
                db.insert_chat(&chat)?;
                Ok((chat, true))
            })?)
        })?;

        if created {
            info!(
                chat = %chat.id,
                creator = %creator,
                participants = chat.participants.len(),
                "Chat created"
            );
        }
        Ok((chat, created))
    }

    /// The user's chats, most recently active first.
    pub fn list_chats(&self, user: UserId) -> Result<Vec<ChatSummary>, ServerError> {
        self.store.with(|db| {
            let mut summaries = Vec::new();
            for chat in db.chats_for_user(user)? {
                let unread_count = db.count_unread(chat.id, user)?;
                let last_message_summary =
                    db.latest_message(chat.id)?.map(|m| LastMessageSummary {
                        is_read: m.is_read_by(&user),
                        content: m.content,
                        created_at: m.created_at,
                        sender: m.sender,
                    });
                summaries.push(ChatSummary {
                    chat,
                    unread_count,
                    last_message_summary,
                });
            }
            Ok(summaries)
        })
    }

    pub fn get_chat(&self, chat_id: ChatId, user: UserId) -> Result<Chat, ServerError> {
        let chat = self
            .store
            .with(|db| db.get_chat(chat_id))
            .or_not_found("chat", chat_id)?;
        if !chat.has_participant(&user) {
            return Err(ServerError::Forbidden(format!(
                "not a participant of chat {chat_id}"
            )));
        }
        Ok(chat)
    }

    pub fn ensure_participant(&self, chat_id: ChatId, user: UserId) -> Result<(), ServerError> {
        self.get_chat(chat_id, user).map(|_| ())
    }

    /// Every message of the chat, oldest first, after marking the reader's
    /// unread ones as read. Marks and result come from one snapshot, so a
    /// message sent meanwhile is neither marked nor returned.
    pub async fn open_chat(&self, chat_id: ChatId, reader: UserId) -> Result<Vec<Message>, ServerError> {
        self.ensure_participant(chat_id, reader)?;

        let mut messages = self.store.with(|db| db.messages_for_chat(chat_id))?;
        let mut marked = 0usize;
        for message in messages.iter_mut() {
            if message.sender == reader || message.is_read_by(&reader) {
                continue;
            }
            let _guard = self.locks.lock(message.id).await;
            let added = self
                .store
                .with(|db| db.add_reader(message.id, reader, Utc::now()))?;
            if added {
                self.publish_read(message, reader).await;
                marked += 1;
            }
            message.read_by.push(reader);
        }
        if marked > 0 {
            debug!(chat = %chat_id, reader = %reader, marked, "Marked messages read on open");
        }

        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send(
        &self,
        chat_id: ChatId,
        sender: UserId,
        draft: MessageDraft,
    ) -> Result<Message, ServerError> {
        let chat = self.get_chat(chat_id, sender)?;

        let content = draft
            .content
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let media_meta = draft.media_meta.filter(|m| !m.url.trim().is_empty());
        if content.is_empty() && media_meta.is_none() {
            return Err(ServerError::Validation(
                "a message needs content or a media reference".into(),
            ));
        }

        let message_type = draft.message_type.unwrap_or(if content.is_empty() {
            MessageType::File
        } else {
            MessageType::Text
        });

        if let Some(reply_to) = draft.reply_to {
            let same_chat = match self.store.with(|db| db.get_message(reply_to)) {
                Ok(original) => original.chat_id == chat_id,
                Err(StoreError::NotFound) => false,
                Err(e) => return Err(e.into()),
            };
            if !same_chat {
                return Err(ServerError::Validation(format!(
                    "reply target {reply_to} is not a message of this chat"
                )));
            }
        }

        let now = Utc::now();
        let message = Message {
            id: MessageId::new(),
            chat_id,
            sender,
            message_type,
            content,
            media_meta,
            reply_to: draft.reply_to,
            read_by: vec![sender],
            reactions: Vec::new(),
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };

        self.store.tx(|db| {
            db.insert_message(&message)?;
            db.set_last_message(chat_id, message.id, now)
        })?;

        let recipients: Vec<Channel> = chat.others(&sender).copied().map(Channel::User).collect();
        let delivered = self
            .relay
            .publish_many(&recipients, RelayEvent::NewMessage(message.clone()))
            .await;

        info!(
            message = %message.id,
            chat = %chat_id,
            sender = %sender,
            message_type = message.message_type.as_str(),
            delivered,
            "Message sent"
        );
        Ok(message)
    }

    /// Add `reader` to the message's read-by set. Returns false when nothing
    /// changed.
    pub async fn mark_read(&self, message_id: MessageId, reader: UserId) -> Result<bool, ServerError> {
        let _guard = self.locks.lock(message_id).await;
        let message = self.load(message_id)?;
        self.ensure_participant(message.chat_id, reader)?;

        if message.sender == reader || message.is_read_by(&reader) {
            return Ok(false);
        }
        let added = self
            .store
            .with(|db| db.add_reader(message_id, reader, Utc::now()))?;
        if added {
            self.publish_read(&message, reader).await;
        }
        Ok(added)
    }

    /// Set `user`'s reaction, replacing any earlier one.
    pub async fn react(
        &self,
        message_id: MessageId,
        user: UserId,
        emoji: &str,
    ) -> Result<Message, ServerError> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
            return Err(ServerError::Validation(format!(
                "emoji must be 1 to {MAX_EMOJI_BYTES} bytes"
            )));
        }

        let _guard = self.locks.lock(message_id).await;
        let message = self.load(message_id)?;
        self.ensure_participant(message.chat_id, user)?;

        let reaction = Reaction {
            user_id: user,
            emoji: emoji.to_string(),
        };
        let message = self.store.with(|db| -> Result<_, StoreError> {
            db.set_reaction(message_id, &reaction, Utc::now())?;
            db.get_message(message_id)
        })?;

        self.relay
            .publish(
                Channel::Chat(message.chat_id),
                RelayEvent::MessageReaction(MessageReaction {
                    message_id,
                    reaction,
                }),
            )
            .await;
        Ok(message)
    }

    pub async fn edit(
        &self,
        message_id: MessageId,
        user: UserId,
        content: &str,
    ) -> Result<Message, ServerError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServerError::Validation("edited content is empty".into()));
        }

        let _guard = self.locks.lock(message_id).await;
        let mut message = self.load(message_id)?;
        if message.sender != user {
            return Err(ServerError::Forbidden("only the sender can edit a message".into()));
        }
        if message.is_deleted {
            return Err(ServerError::InvalidTransition(Rejection {
                entity: "message".into(),
                id: message_id.to_string(),
                state: "deleted".into(),
                command: "edit".into(),
                superseded: true,
            }));
        }

        message.content = content.to_string();
        message.is_edited = true;
        message.updated_at = Utc::now();
        self.store.with(|db| db.update_message_content(&message))?;

        debug!(message = %message_id, "Message edited");
        self.relay
            .publish(
                Channel::Chat(message.chat_id),
                RelayEvent::MessageEdited(message.clone()),
            )
            .await;
        Ok(message)
    }

    /// Soft delete. Deleting twice returns the tombstoned message again
    /// without a second event.
    pub async fn delete(&self, message_id: MessageId, user: UserId) -> Result<Message, ServerError> {
        let _guard = self.locks.lock(message_id).await;
        let mut message = self.load(message_id)?;
        if message.sender != user {
            return Err(ServerError::Forbidden("only the sender can delete a message".into()));
        }
        if message.is_deleted {
            return Ok(message);
        }

        message.content = DELETED_MESSAGE_TOMBSTONE.to_string();
        message.is_deleted = true;
        message.updated_at = Utc::now();
        self.store.with(|db| db.update_message_content(&message))?;

        info!(message = %message_id, chat = %message.chat_id, "Message deleted");
        self.relay
            .publish(
                Channel::Chat(message.chat_id),
                RelayEvent::MessageDeleted(MessageDeleted {
                    message_id,
                    chat_id: message.chat_id,
                }),
            )
            .await;
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Unread counters
    // ------------------------------------------------------------------

    pub fn unread_counts(&self, user: UserId) -> Result<Vec<UnreadCount>, ServerError> {
        self.store.with(|db| {
            let mut counts = Vec::new();
            for chat in db.chats_for_user(user)? {
                counts.push(UnreadCount {
                    chat_id: chat.id,
                    count: db.count_unread(chat.id, user)?,
                });
            }
            Ok(counts)
        })
    }

    pub fn unread_total(&self, user: UserId) -> Result<u64, ServerError> {
        Ok(self.unread_counts(user)?.iter().map(|c| c.count).sum())
    }

    // ------------------------------------------------------------------
    // Typing indicators
    // ------------------------------------------------------------------

    /// Relay a typing indicator to the chat room, skipping the issuing
    /// connection. Nothing is stored.
    pub async fn typing(
        &self,
        chat_id: ChatId,
        user: UserId,
        conn: ConnectionId,
        started: bool,
    ) -> Result<(), ServerError> {
        self.ensure_participant(chat_id, user)?;
        let notice = TypingNotice { chat_id, user_id: user };
        let event = if started {
            RelayEvent::Typing(notice)
        } else {
            RelayEvent::StopTyping(notice)
        };
        self.relay.publish_except(Channel::Chat(chat_id), event, conn).await;
        Ok(())
    }

    pub(crate) fn purge_idle_locks(&self) -> usize {
        self.locks.purge_idle()
    }

    fn load(&self, message_id: MessageId) -> Result<Message, ServerError> {
        self.store
            .with(|db| db.get_message(message_id))
            .or_not_found("message", message_id)
    }

    async fn publish_read(&self, message: &Message, reader: UserId) {
        self.relay
            .publish_many(
                &[Channel::Chat(message.chat_id), Channel::User(message.sender)],
                RelayEvent::MessageRead(MessageRead {
                    message_id: message.id,
                    user_id: reader,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_user, drain, Harness};
    use parley_shared::error::ErrorKind;
    use parley_shared::models::MediaMeta;

    async fn pair_chat(h: &Harness) -> (UserId, UserId, Chat) {
        let ada = add_user(h, "Ada");
        let bob = add_user(h, "Bob");
        let (chat, created) = h.messages.create_chat(ada.id, vec![bob.id], None).await.unwrap();
        assert!(created);
        (ada.id, bob.id, chat)
    }

    fn reads(events: &[RelayEvent]) -> Vec<&MessageRead> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::MessageRead(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chat_open_scenario() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let mut ada_sub = h.relay.connect(ada).await;
        let mut bob_sub = h.relay.connect(bob).await;

        let sent = h.messages.send(chat.id, ada, MessageDraft::text("hi")).await.unwrap();

        let events = drain(&mut bob_sub.events);
        match &events[..] {
            [RelayEvent::NewMessage(m)] => {
                assert_eq!(m.id, sent.id);
                assert_eq!(m.read_by, vec![ada]);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(drain(&mut ada_sub.events).is_empty());
        assert_eq!(h.messages.unread_total(bob).unwrap(), 1);

        let messages = h.messages.open_chat(chat.id, bob).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_read_by(&bob));
        assert_eq!(h.messages.unread_total(bob).unwrap(), 0);

        let ada_events = drain(&mut ada_sub.events);
        let receipts = reads(&ada_events);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].message_id, sent.id);
        assert_eq!(receipts[0].user_id, bob);

        h.messages.open_chat(chat.id, bob).await.unwrap();
        assert!(drain(&mut ada_sub.events).is_empty());
    }

    #[tokio::test]
    async fn test_open_chat_marks_unread_in_creation_order() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;

        let first = h.messages.send(chat.id, ada, MessageDraft::text("one")).await.unwrap();
        let already = h.messages.send(chat.id, ada, MessageDraft::text("two")).await.unwrap();
        h.messages.send(chat.id, bob, MessageDraft::text("mine")).await.unwrap();
        let third = h.messages.send(chat.id, ada, MessageDraft::text("three")).await.unwrap();
        let fourth = h.messages.send(chat.id, ada, MessageDraft::text("four")).await.unwrap();
        assert!(h.messages.mark_read(already.id, bob).await.unwrap());

        let mut ada_sub = h.relay.connect(ada).await;
        let messages = h.messages.open_chat(chat.id, bob).await.unwrap();
        assert_eq!(messages.len(), 5);
        assert!(messages.iter().all(|m| m.is_read_by(&bob)));

        let events = drain(&mut ada_sub.events);
        let receipts: Vec<_> = reads(&events)
            .into_iter()
            .map(|r| (r.message_id, r.user_id))
            .collect();
        assert_eq!(
            receipts,
            vec![(first.id, bob), (third.id, bob), (fourth.id, bob)]
        );
        assert_eq!(h.messages.unread_total(bob).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receipt_reaches_room_and_sender_once() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let mut ada_sub = h.relay.connect(ada).await;
        h.relay.join(ada_sub.id, Channel::Chat(chat.id)).await;

        let sent = h.messages.send(chat.id, ada, MessageDraft::text("ping")).await.unwrap();
        assert!(h.messages.mark_read(sent.id, bob).await.unwrap());
        assert!(!h.messages.mark_read(sent.id, bob).await.unwrap());
        assert!(!h.messages.mark_read(sent.id, ada).await.unwrap());

        assert_eq!(reads(&drain(&mut ada_sub.events)).len(), 1);
        let readers = h.store.with(|db| db.readers_of(sent.id)).unwrap();
        assert_eq!(readers, vec![ada, bob]);
    }

    #[tokio::test]
    async fn test_unread_round_trip() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;

        let first = h.messages.send(chat.id, ada, MessageDraft::text("one")).await.unwrap();
        h.messages.send(chat.id, ada, MessageDraft::text("two")).await.unwrap();

        let counts = h.messages.unread_counts(bob).unwrap();
        assert_eq!(counts, vec![UnreadCount { chat_id: chat.id, count: 2 }]);
        assert_eq!(h.messages.unread_total(ada).unwrap(), 0);

        h.messages.mark_read(first.id, bob).await.unwrap();
        assert_eq!(h.messages.unread_total(bob).unwrap(), 1);

        let summaries = h.messages.list_chats(bob).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 1);
        let last = summaries[0].last_message_summary.as_ref().unwrap();
        assert_eq!(last.content, "two");
        assert!(!last.is_read);
    }

    #[tokio::test]
    async fn test_react_replaces_previous_reaction() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let mut room = h.relay.connect(ada).await;
        h.relay.join(room.id, Channel::Chat(chat.id)).await;

        let sent = h.messages.send(chat.id, ada, MessageDraft::text("hi")).await.unwrap();
        h.messages.react(sent.id, bob, "👍").await.unwrap();
        h.messages.react(sent.id, ada, "🎉").await.unwrap();
        let message = h.messages.react(sent.id, bob, "❤️").await.unwrap();

        let from_bob: Vec<_> = message.reactions.iter().filter(|r| r.user_id == bob).collect();
        assert_eq!(from_bob.len(), 1);
        assert_eq!(from_bob[0].emoji, "❤️");
        assert_eq!(message.reactions.len(), 2);
        assert_eq!(drain(&mut room.events).len(), 3);

        let err = h.messages.react(sent.id, bob, "  ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_edit_and_delete_are_sender_only() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let sent = h.messages.send(chat.id, ada, MessageDraft::text("hi")).await.unwrap();

        let err = h.messages.edit(sent.id, bob, "hijacked").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = h.messages.delete(sent.id, bob).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let edited = h.messages.edit(sent.id, ada, "hello").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "hello");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_terminal() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let mut room = h.relay.connect(bob).await;
        h.relay.join(room.id, Channel::Chat(chat.id)).await;

        let draft = MessageDraft {
            media_meta: Some(MediaMeta {
                url: "/uploads/cat.png".into(),
                ..Default::default()
            }),
            message_type: Some(MessageType::Image),
            ..Default::default()
        };
        let sent = h.messages.send(chat.id, ada, draft).await.unwrap();
        drain(&mut room.events);

        let deleted = h.messages.delete(sent.id, ada).await.unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.content, DELETED_MESSAGE_TOMBSTONE);
        assert_eq!(deleted.message_type, MessageType::Image);
        assert!(deleted.media_meta.is_some());
        assert!(deleted.visible_media().is_none());

        let again = h.messages.delete(sent.id, ada).await.unwrap();
        assert_eq!(again, deleted);
        let events = drain(&mut room.events);
        assert!(matches!(
            &events[..],
            [RelayEvent::MessageDeleted(d)] if d.message_id == sent.id && d.chat_id == chat.id
        ));

        let err = h.messages.edit(sent.id, ada, "back").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let eve = add_user(&h, "Eve");

        let err = h.messages.send(chat.id, ada, MessageDraft::text("   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h.messages.send(chat.id, eve.id, MessageDraft::text("hi")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = h.messages.send(ChatId::new(), ada, MessageDraft::text("hi")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let (other, _) = h.messages.create_chat(ada, vec![eve.id], None).await.unwrap();
        let elsewhere = h.messages.send(other.id, ada, MessageDraft::text("x")).await.unwrap();
        let reply = MessageDraft {
            reply_to: Some(elsewhere.id),
            ..MessageDraft::text("re")
        };
        let err = h.messages.send(chat.id, bob, reply).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let media_only = MessageDraft {
            media_meta: Some(MediaMeta {
                url: "/uploads/notes.pdf".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let sent = h.messages.send(chat.id, bob, media_only).await.unwrap();
        assert_eq!(sent.message_type, MessageType::File);
    }

    #[tokio::test]
    async fn test_create_chat_dedupes_participant_sets() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let cy = add_user(&h, "Cy");

        let (first, created) = h.messages.create_chat(ada.id, vec![bob.id], None).await.unwrap();
        assert!(created);
        let (again, created) = h
            .messages
            .create_chat(bob.id, vec![ada.id, ada.id], None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);

        let (group, _) = h
            .messages
            .create_chat(ada.id, vec![bob.id, cy.id], Some("  Team  ".into()))
            .await
            .unwrap();
        assert!(group.is_group);
        assert_eq!(group.admin, Some(ada.id));
        assert_eq!(group.name.as_deref(), Some("Team"));

        let err = h.messages.create_chat(ada.id, vec![ada.id], None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = h
            .messages
            .create_chat(ada.id, vec![UserId::new()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h.messages.get_chat(first.id, cy.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_typing_skips_issuing_connection() {
        let h = Harness::new();
        let (ada, bob, chat) = pair_chat(&h).await;
        let mut ada_sub = h.relay.connect(ada).await;
        let mut bob_sub = h.relay.connect(bob).await;
        h.relay.join(ada_sub.id, Channel::Chat(chat.id)).await;
        h.relay.join(bob_sub.id, Channel::Chat(chat.id)).await;

        h.messages.typing(chat.id, ada, ada_sub.id, true).await.unwrap();
        h.messages.typing(chat.id, ada, ada_sub.id, false).await.unwrap();

        assert!(drain(&mut ada_sub.events).is_empty());
        let events = drain(&mut bob_sub.events);
        assert!(matches!(
            &events[..],
            [RelayEvent::Typing(t), RelayEvent::StopTyping(_)] if t.user_id == ada
        ));
    }
}
