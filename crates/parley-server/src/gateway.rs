//! WebSocket gateway.
//!
//! One task per socket. The connection authenticates (query token or a
//! first `authenticate` command), registers with the relay, and then
//! interleaves two streams: commands read from the socket, answered with
//! `command_result`, and relay events forwarded as they arrive. Commands
//! from one socket are handled strictly one after another.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use parley_shared::constants::AUTH_HANDSHAKE_SECS;
use parley_shared::protocol::{
    ClientCommand, CommandEnvelope, CommandReply, RelayEvent, RoomMembership, SignalRelay,
};
use parley_shared::types::{Channel, UserId};

use crate::api::AppState;
use crate::error::ServerError;
use crate::relay::ConnectionId;

/// The authenticated identity behind one relay connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSession {
    pub id: ConnectionId,
    pub principal: UserId,
}

#[derive(Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.token, state))
}

async fn handle_socket(socket: WebSocket, token: Option<String>, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let handshake = match token {
        Some(token) => state.verifier.verify(&token).map(|principal| (principal, None)),
        None => match tokio::time::timeout(
            Duration::from_secs(AUTH_HANDSHAKE_SECS),
            wait_for_authenticate(&mut receiver, &state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServerError::Authentication(
                "no credential presented in time".into(),
            )),
        },
    };

    let principal = match handshake {
        Ok((principal, request_id)) => {
            let reply = CommandReply::success(request_id, Some(json!({ "userId": principal })));
            if send_event(&mut sender, &RelayEvent::CommandResult(reply)).await.is_err() {
                return;
            }
            principal
        }
        Err(e) => {
            debug!(error = %e, "Rejecting relay connection");
            let reply = CommandReply::failure(None, e.to_failure());
            let _ = send_event(&mut sender, &RelayEvent::CommandResult(reply)).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let subscription = state.relay.connect(principal).await;
    let session = ConnectionSession {
        id: subscription.id,
        principal,
    };
    if let Err(e) = state
        .presence
        .connected(principal, subscription.first_for_principal)
        .await
    {
        warn!(principal = %principal, error = %e, "Presence update on connect failed");
    }

    let mut events = subscription.events;
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_frame(&state, &session, &text).await;
                    if send_event(&mut sender, &RelayEvent::CommandResult(reply)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum; binary frames are not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %session.id, error = %e, "Socket read failed");
                    break;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    close_session(&state, session).await;
}

/// Read frames until an `authenticate` command arrives.
async fn wait_for_authenticate(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(UserId, Option<String>), ServerError> {
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        return authenticate_frame(state, &text);
    }
    Err(ServerError::Authentication("connection closed before authenticate".into()))
}

/// Check the first text frame of an unauthenticated connection. Anything
/// but a well-formed `authenticate` with a valid token is an
/// authentication failure.
fn authenticate_frame(state: &AppState, text: &str) -> Result<(UserId, Option<String>), ServerError> {
    let envelope = CommandEnvelope::from_json(text)
        .map_err(|e| ServerError::Authentication(format!("malformed authenticate frame: {e}")))?;
    match envelope.command {
        ClientCommand::Authenticate { token } => state
            .verifier
            .verify(&token)
            .map(|principal| (principal, envelope.request_id)),
        other => Err(ServerError::Authentication(format!(
            "'{}' sent before authenticate",
            other.name()
        ))),
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RelayEvent,
) -> Result<(), axum::Error> {
    let text = match event.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode relay event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}

/// Undo everything the connection registered: relay memberships, call room
/// presence and, for the last connection, the principal's online status.
pub async fn close_session(state: &AppState, session: ConnectionSession) {
    let Some(departure) = state.relay.disconnect(session.id).await else {
        return;
    };

    for room in &departure.rooms {
        match *room {
            Channel::Room(room_id) => {
                if !state.relay.principals_in(*room).await.contains(&session.principal) {
                    state.calls.room_left(room_id, session.principal).await;
                }
            }
            Channel::Chat(chat_id) => {
                let left = RelayEvent::UserLeft(RoomMembership {
                    chat_id,
                    user_id: session.principal,
                    timestamp: Utc::now(),
                });
                state.relay.publish(*room, left).await;
            }
            Channel::User(_) => {}
        }
    }

    if let Err(e) = state
        .presence
        .disconnected(session.principal, departure.last_for_principal)
        .await
    {
        warn!(principal = %session.principal, error = %e, "Presence update on disconnect failed");
    }
}

/// Parse and run one text frame, producing the reply for the issuer.
pub async fn handle_frame(state: &AppState, session: &ConnectionSession, text: &str) -> CommandReply {
    let envelope = match CommandEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = ServerError::Validation(format!("malformed command: {e}"));
            return CommandReply::failure(None, err.to_failure());
        }
    };

    let command = envelope.command.name();
    match dispatch(state, session, envelope.command).await {
        Ok(data) => CommandReply::success(envelope.request_id, data),
        Err(e) => {
            e.log_if_internal();
            debug!(conn = %session.id, command, error = %e, "Command failed");
            CommandReply::failure(envelope.request_id, e.to_failure())
        }
    }
}

fn data<T: Serialize>(value: &T) -> Result<Option<Value>, ServerError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ServerError::Internal(format!("encode reply: {e}")))
}

/// Route a command to the manager that owns it.
pub async fn dispatch(
    state: &AppState,
    session: &ConnectionSession,
    command: ClientCommand,
) -> Result<Option<Value>, ServerError> {
    let me = session.principal;
    let conn = session.id;

    match command {
        ClientCommand::Authenticate { .. } => {
            Err(ServerError::Validation("connection is already authenticated".into()))
        }
        ClientCommand::Ping => Ok(Some(json!({ "pong": true }))),

        // Rooms
        ClientCommand::JoinChat { chat_id } => {
            state.messages.ensure_participant(chat_id, me)?;
            let channel = Channel::Chat(chat_id);
            let joined = state.relay.join(conn, channel).await;
            if joined {
                let event = RelayEvent::UserJoined(RoomMembership {
                    chat_id,
                    user_id: me,
                    timestamp: Utc::now(),
                });
                state.relay.publish_except(channel, event, conn).await;
            }
            Ok(Some(json!({ "joined": joined })))
        }
        ClientCommand::LeaveChat { chat_id } => {
            let channel = Channel::Chat(chat_id);
            let left = state.relay.leave(conn, channel).await;
            if left {
                let event = RelayEvent::UserLeft(RoomMembership {
                    chat_id,
                    user_id: me,
                    timestamp: Utc::now(),
                });
                state.relay.publish(channel, event).await;
            }
            Ok(Some(json!({ "left": left })))
        }
        ClientCommand::JoinCallRoom { room_id } => {
            let call = state.calls.room_joined(room_id, me).await?;
            state.relay.join(conn, Channel::Room(room_id)).await;
            info!(conn = %conn, call = %call.id, room = %room_id, "Joined call room");
            data(&call)
        }
        ClientCommand::LeaveCallRoom { room_id } => {
            let channel = Channel::Room(room_id);
            let left = state.relay.leave(conn, channel).await;
            if left && !state.relay.principals_in(channel).await.contains(&me) {
                state.calls.room_left(room_id, me).await;
            }
            Ok(Some(json!({ "left": left })))
        }
        ClientCommand::Typing { chat_id } => {
            state.messages.typing(chat_id, me, conn, true).await?;
            Ok(None)
        }
        ClientCommand::StopTyping { chat_id } => {
            state.messages.typing(chat_id, me, conn, false).await?;
            Ok(None)
        }
        ClientCommand::Signal { room_id, to, payload } => {
            let channel = Channel::Room(room_id);
            if !state.relay.is_member(conn, channel).await {
                return Err(ServerError::Forbidden(format!(
                    "not a member of room {room_id}"
                )));
            }
            let event = RelayEvent::Signal(SignalRelay {
                room_id,
                from: me,
                payload,
            });
            let delivered = match to {
                Some(target) => state.relay.publish_to_principal_in(channel, target, event).await,
                None => state.relay.publish_except(channel, event, conn).await,
            };
            Ok(Some(json!({ "delivered": delivered })))
        }

        // Calls
        ClientCommand::InitiateCall {
            callee_id,
            call_type,
            chat_id,
        } => data(&state.calls.initiate(me, callee_id, call_type, chat_id).await?),
        ClientCommand::AcceptCall { call_id } => data(&state.calls.accept(call_id, me).await?),
        ClientCommand::RejectCall { call_id } => data(&state.calls.reject(call_id, me).await?),
        ClientCommand::CancelCall { call_id } => data(&state.calls.cancel(call_id, me).await?),
        ClientCommand::EndCall { call_id } => data(&state.calls.end(call_id, me).await?),

        // Messages
        ClientCommand::OpenChat { chat_id } => data(&state.messages.open_chat(chat_id, me).await?),
        ClientCommand::SendMessage { chat_id, draft } => {
            data(&state.messages.send(chat_id, me, draft).await?)
        }
        ClientCommand::MarkRead { message_id } => {
            let updated = state.messages.mark_read(message_id, me).await?;
            Ok(Some(json!({ "updated": updated })))
        }
        ClientCommand::React { message_id, emoji } => {
            data(&state.messages.react(message_id, me, &emoji).await?)
        }
        ClientCommand::EditMessage {
            message_id,
            content,
        } => data(&state.messages.edit(message_id, me, &content).await?),
        ClientCommand::DeleteMessage { message_id } => {
            data(&state.messages.delete(message_id, me).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_user, drain, Harness};
    use crate::relay::Subscription;
    use parley_shared::error::ErrorKind;
    use parley_shared::protocol::MessageDraft;
    use parley_shared::types::CallType;

    async fn open(h: &Harness, principal: UserId) -> (ConnectionSession, Subscription) {
        let sub = h.relay.connect(principal).await;
        let session = ConnectionSession {
            id: sub.id,
            principal,
        };
        (session, sub)
    }

    fn frame(request_id: &str, command: ClientCommand) -> String {
        CommandEnvelope::new(Some(request_id.into()), command)
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_frame_is_a_validation_failure() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let (session, _sub) = open(&h, ada.id).await;

        let reply = handle_frame(&h.state, &session, "{not json").await;
        assert!(!reply.ok);
        assert_eq!(reply.request_id, None);
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Validation);

        let reply = handle_frame(&h.state, &session, &frame("1", ClientCommand::Ping)).await;
        assert!(reply.ok);
        assert_eq!(reply.request_id.as_deref(), Some("1"));
        assert_eq!(reply.data.unwrap()["pong"], true);

        let again = ClientCommand::Authenticate { token: "x".into() };
        let reply = handle_frame(&h.state, &session, &frame("2", again)).await;
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_first_frame_must_authenticate() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");

        for text in ["{not json".to_string(), frame("1", ClientCommand::Ping)] {
            let err = authenticate_frame(&h.state, &text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Authentication);
        }
        let forged = frame("2", ClientCommand::Authenticate { token: "forged".into() });
        let err = authenticate_frame(&h.state, &forged).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let token = h.state.tokens.issue(ada.id);
        let valid = frame("3", ClientCommand::Authenticate { token });
        let (principal, request_id) = authenticate_frame(&h.state, &valid).unwrap();
        assert_eq!(principal, ada.id);
        assert_eq!(request_id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_join_chat_requires_participation() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let eve = add_user(&h, "Eve");
        let (chat, _) = h.messages.create_chat(ada.id, vec![bob.id], None).await.unwrap();

        let (ada_session, mut ada_sub) = open(&h, ada.id).await;
        let (bob_session, mut bob_sub) = open(&h, bob.id).await;
        let (eve_session, _eve_sub) = open(&h, eve.id).await;

        let join = ClientCommand::JoinChat { chat_id: chat.id };
        let reply = handle_frame(&h.state, &eve_session, &frame("1", join.clone())).await;
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Forbidden);

        assert!(handle_frame(&h.state, &ada_session, &frame("2", join.clone())).await.ok);
        assert!(handle_frame(&h.state, &bob_session, &frame("3", join)).await.ok);

        let events = drain(&mut ada_sub.events);
        assert!(matches!(&events[..], [RelayEvent::UserJoined(j)] if j.user_id == bob.id));
        assert!(drain(&mut bob_sub.events).is_empty());

        close_session(&h.state, bob_session).await;
        let events = drain(&mut ada_sub.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, RelayEvent::UserLeft(l) if l.user_id == bob.id)));
    }

    #[tokio::test]
    async fn test_signal_is_scoped_to_room_members() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let call = h
            .calls
            .initiate(ada.id, bob.id, CallType::Video, None)
            .await
            .unwrap();

        let (ada_session, _ada_sub) = open(&h, ada.id).await;
        let (bob_session, mut bob_sub) = open(&h, bob.id).await;
        drain(&mut bob_sub.events);

        let signal = ClientCommand::Signal {
            room_id: call.room_id,
            to: None,
            payload: json!({ "kind": "offer", "sdp": "v=0" }),
        };
        let reply = handle_frame(&h.state, &ada_session, &frame("1", signal.clone())).await;
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Forbidden);

        let accept = ClientCommand::AcceptCall { call_id: call.id };
        assert!(handle_frame(&h.state, &bob_session, &frame("2", accept)).await.ok);

        let join = ClientCommand::JoinCallRoom { room_id: call.room_id };
        assert!(handle_frame(&h.state, &ada_session, &frame("3", join.clone())).await.ok);
        assert!(handle_frame(&h.state, &bob_session, &frame("4", join)).await.ok);
        assert_eq!(
            h.calls.state(call.id).await.unwrap(),
            parley_shared::types::CallState::Connected
        );

        let reply = handle_frame(&h.state, &ada_session, &frame("5", signal)).await;
        assert!(reply.ok);
        assert_eq!(reply.data.unwrap()["delivered"], 1);
        let events = drain(&mut bob_sub.events);
        assert!(matches!(
            &events[..],
            [RelayEvent::Signal(s)] if s.from == ada.id && s.payload["kind"] == "offer"
        ));
    }

    #[tokio::test]
    async fn test_message_commands_round_trip() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let (chat, _) = h.messages.create_chat(ada.id, vec![bob.id], None).await.unwrap();
        let (ada_session, _ada_sub) = open(&h, ada.id).await;
        let (bob_session, mut bob_sub) = open(&h, bob.id).await;

        let send = ClientCommand::SendMessage {
            chat_id: chat.id,
            draft: MessageDraft::text("hi"),
        };
        let reply = handle_frame(&h.state, &ada_session, &frame("1", send)).await;
        assert!(reply.ok);
        let message_id = reply.data.unwrap()["id"].as_str().unwrap().to_string();
        assert!(matches!(&drain(&mut bob_sub.events)[..], [RelayEvent::NewMessage(_)]));

        let edit = format!(
            r#"{{"requestId":"2","command":{{"type":"edit_message","messageId":"{message_id}","content":"nope"}}}}"#
        );
        let reply = handle_frame(&h.state, &bob_session, &edit).await;
        let failure = reply.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::Forbidden);
        assert!(!failure.superseded);

        let open_chat = ClientCommand::OpenChat { chat_id: chat.id };
        let reply = handle_frame(&h.state, &bob_session, &frame("3", open_chat)).await;
        assert_eq!(reply.data.unwrap().as_array().unwrap().len(), 1);
        assert_eq!(h.messages.unread_total(bob.id).unwrap(), 0);
    }
}
