//! Call session manager.
//!
//! Owns the call state machine:
//!
//! ```text
//! idle -> ringing -> accepted -> connected -> ended
//!            \______________________________/
//!             reject / cancel / ring timeout
//! ```
//!
//! Each live call has one session behind an async mutex, so transitions of
//! the same call apply one at a time in arrival order and the loser of a
//! race sees the already-mutated state. The store is written before the
//! in-memory state moves and before any event is published.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::error::Rejection;
use parley_shared::models::{Call, CallLog};
use parley_shared::protocol::{CallAccepted, CallRef, IncomingCall, RelayEvent};
use parley_shared::types::{
    CallId, CallOutcome, CallState, CallStatus, CallType, Channel, ChatId, RoomId, UserId,
};
use parley_store::StoreError;

use crate::error::{OrNotFound, ServerError};
use crate::relay::EventRelay;
use crate::store::StoreHandle;

/// Delay before a ring timeout whose store write failed is tried again.
const EXPIRE_RETRY: Duration = Duration::from_secs(1);

/// Commands that move an existing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Accept,
    Reject,
    Cancel,
    End,
    /// Join the call's transport room.
    Join,
}

impl CallCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::End => "end",
            Self::Join => "join",
        }
    }

    fn legal_states(&self) -> &'static [CallState] {
        match self {
            Self::Accept | Self::Reject | Self::Cancel => &[CallState::Ringing],
            Self::End | Self::Join => &[CallState::Accepted, CallState::Connected],
        }
    }

    fn actor_allowed(&self, call: &Call, actor: UserId) -> bool {
        match self {
            Self::Accept | Self::Reject => actor == call.callee,
            Self::Cancel => actor == call.caller,
            Self::End | Self::Join => call.is_party(&actor),
        }
    }
}

/// Check that `actor` may apply `command` to a call in `state`.
///
/// The rejection is marked superseded when the actor had the right role
/// but the call already moved past every state the command is legal in.
pub fn authorize(
    call: &Call,
    state: CallState,
    command: CallCommand,
    actor: UserId,
) -> Result<(), ServerError> {
    let role_ok = command.actor_allowed(call, actor);
    let legal = command.legal_states();
    if role_ok && legal.contains(&state) {
        return Ok(());
    }

    Err(ServerError::InvalidTransition(Rejection {
        entity: "call".to_string(),
        id: call.id.to_string(),
        state: state.as_str().to_string(),
        command: command.as_str().to_string(),
        superseded: role_ok && legal.iter().all(|legal| state > *legal),
    }))
}

struct CallSession {
    call: Call,
    state: CallState,
    /// Principals currently in the call's transport room.
    joined: HashSet<UserId>,
    timeout: Option<JoinHandle<()>>,
}

impl CallSession {
    fn disarm(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }

    fn finish(&mut self, ended_at: DateTime<Utc>) {
        self.disarm();
        self.state = CallState::Ended;
        self.call.status = CallStatus::Ended;
        self.call.ended_at = Some(ended_at);
    }
}

type SharedSession = Arc<AsyncMutex<CallSession>>;

struct Inner {
    store: StoreHandle,
    relay: EventRelay,
    ring_timeout: Duration,
    sessions: Mutex<HashMap<CallId, SharedSession>>,
    rooms: Mutex<HashMap<RoomId, CallId>>,
}

#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<Inner>,
}

impl CallSessionManager {
    pub fn new(store: StoreHandle, relay: EventRelay, ring_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                relay,
                ring_timeout,
                sessions: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start ringing `callee`. Returns the new call.
    pub async fn initiate(
        &self,
        caller: UserId,
        callee: UserId,
        call_type: CallType,
        chat_id: Option<ChatId>,
    ) -> Result<Call, ServerError> {
        if caller == callee {
            return Err(ServerError::Validation("cannot call yourself".into()));
        }

        let caller_user = self.inner.store.with(|db| -> Result<_, ServerError> {
            let caller_user = db.get_user(caller).or_not_found("user", caller)?;
            db.get_user(callee).or_not_found("user", callee)?;

            if let Some(chat_id) = chat_id {
                let chat = match db.get_chat(chat_id) {
                    Ok(chat) => chat,
                    Err(StoreError::NotFound) => {
                        return Err(ServerError::Validation(format!(
                            "referenced chat {chat_id} does not exist"
                        )))
                    }
                    Err(e) => return Err(e.into()),
                };
                if !chat.has_participant(&caller) || !chat.has_participant(&callee) {
                    return Err(ServerError::Validation(
                        "both parties must belong to the referenced chat".into(),
                    ));
                }
            }
            Ok(caller_user)
        })?;

        let now = Utc::now();
        let call = Call {
            id: CallId::new(),
            caller,
            callee,
            call_type,
            status: CallStatus::Pending,
            room_id: RoomId::new(),
            chat_id,
            started_at: now,
            ended_at: None,
        };
        let log = CallLog {
            id: Uuid::new_v4(),
            call_id: call.id,
            chat_id,
            caller,
            callee,
            call_type,
            outcome: CallOutcome::Missed,
            duration_secs: 0,
            started_at: now,
            ended_at: None,
        };

        self.inner.store.tx(|db| {
            db.insert_call(&call)?;
            db.insert_call_log(&log)
        })?;

        // Publish under the session lock so the ring timeout can never
        // overtake the incoming_call event.
        let shared = self.adopt(call.clone());
        let _session = shared.lock().await;

        info!(
            call = %call.id,
            caller = %caller,
            callee = %callee,
            call_type = call_type.as_str(),
            "Call initiated"
        );

        self.inner
            .relay
            .publish(
                Channel::User(callee),
                RelayEvent::IncomingCall(IncomingCall {
                    call_id: call.id,
                    caller: caller_user.summary(),
                    call_type,
                    room_id: call.room_id,
                }),
            )
            .await;

        Ok(call)
    }

    pub async fn accept(&self, call_id: CallId, actor: UserId) -> Result<Call, ServerError> {
        let shared = self.session(call_id)?;
        let mut session = shared.lock().await;
        authorize(&session.call, session.state, CallCommand::Accept, actor)?;

        let participant = self.inner.store.with(|db| -> Result<_, ServerError> {
            let participant = db.get_user(actor).or_not_found("user", actor)?;
            db.in_transaction(|db| {
                db.update_call_status(call_id, CallStatus::Accepted, None)?;
                db.set_call_log_outcome(call_id, CallOutcome::Accepted)
            })?;
            Ok(participant)
        })?;

        session.disarm();
        session.state = CallState::Accepted;
        session.call.status = CallStatus::Accepted;

        info!(call = %call_id, callee = %actor, "Call accepted");

        let call = session.call.clone();
        self.inner
            .relay
            .publish(
                Channel::User(call.caller),
                RelayEvent::CallAccepted(CallAccepted {
                    call_id,
                    participant: participant.summary(),
                    call_type: call.call_type,
                    room_id: call.room_id,
                }),
            )
            .await;

        Ok(call)
    }

    pub async fn reject(&self, call_id: CallId, actor: UserId) -> Result<Call, ServerError> {
        let shared = self.session(call_id)?;
        let mut session = shared.lock().await;
        authorize(&session.call, session.state, CallCommand::Reject, actor)?;

        let now = Utc::now();
        self.inner.store.tx(|db| {
            db.update_call_status(call_id, CallStatus::Ended, Some(now))?;
            db.set_call_log_outcome(call_id, CallOutcome::Rejected)?;
            db.close_call_log(call_id, now, 0)
        })?;

        session.finish(now);
        self.retire(&session.call);

        info!(call = %call_id, callee = %actor, "Call rejected");

        let call = session.call.clone();
        self.inner
            .relay
            .publish(Channel::User(call.caller), RelayEvent::CallRejected(CallRef { call_id }))
            .await;

        Ok(call)
    }

    pub async fn cancel(&self, call_id: CallId, actor: UserId) -> Result<Call, ServerError> {
        let shared = self.session(call_id)?;
        let mut session = shared.lock().await;
        authorize(&session.call, session.state, CallCommand::Cancel, actor)?;

        let now = Utc::now();
        self.inner.store.tx(|db| {
            db.update_call_status(call_id, CallStatus::Ended, Some(now))?;
            db.close_call_log(call_id, now, 0)
        })?;

        session.finish(now);
        self.retire(&session.call);

        info!(call = %call_id, caller = %actor, "Call cancelled");

        let call = session.call.clone();
        self.inner
            .relay
            .publish(Channel::User(call.callee), RelayEvent::CallCancelled(CallRef { call_id }))
            .await;

        Ok(call)
    }

    pub async fn end(&self, call_id: CallId, actor: UserId) -> Result<Call, ServerError> {
        let shared = self.session(call_id)?;
        let mut session = shared.lock().await;
        authorize(&session.call, session.state, CallCommand::End, actor)?;

        let now = Utc::now();
        let duration = CallLog::duration_until(session.call.started_at, now);
        self.inner.store.tx(|db| {
            db.update_call_status(call_id, CallStatus::Ended, Some(now))?;
            db.close_call_log(call_id, now, duration)
        })?;

        session.finish(now);
        self.retire(&session.call);

        info!(call = %call_id, by = %actor, duration_secs = duration, "Call ended");

        let call = session.call.clone();
        self.inner
            .relay
            .publish_many(
                &[Channel::User(call.caller), Channel::User(call.callee)],
                RelayEvent::CallEnded(CallRef { call_id }),
            )
            .await;

        Ok(call)
    }

    /// Ring timeout. A no-op unless the call is still ringing.
    pub(crate) async fn expire(&self, call_id: CallId) -> bool {
        let Some(shared) = self.live(call_id) else {
            return false;
        };
        let mut session = shared.lock().await;
        // This runs inside the timeout task itself; detach, don't abort.
        session.timeout.take();

        if session.state != CallState::Ringing {
            debug!(call = %call_id, state = %session.state, "Ring timeout after transition, ignoring");
            return false;
        }

        let now = Utc::now();
        let persisted = self.inner.store.tx(|db| {
            db.update_call_status(call_id, CallStatus::Ended, Some(now))?;
            db.close_call_log(call_id, now, 0)
        });
        if let Err(e) = persisted {
            warn!(call = %call_id, error = %e, "Failed to persist ring timeout, retrying");
            session.timeout = Some(self.arm_timeout(call_id, EXPIRE_RETRY));
            return false;
        }

        session.finish(now);
        self.retire(&session.call);

        info!(call = %call_id, "Call rang out");

        let call = &session.call;
        self.inner
            .relay
            .publish_many(
                &[Channel::User(call.caller), Channel::User(call.callee)],
                RelayEvent::CallCancelled(CallRef { call_id }),
            )
            .await;
        true
    }

    // ------------------------------------------------------------------
    // Transport room side protocol
    // ------------------------------------------------------------------

    /// Record that `user` joined the call's transport room. The call becomes
    /// `connected` once both parties are in.
    pub async fn room_joined(&self, room: RoomId, user: UserId) -> Result<Call, ServerError> {
        let call_id = self.call_for_room(room)?;
        let shared = self.session(call_id)?;
        let mut session = shared.lock().await;

        if !session.call.is_party(&user) {
            return Err(ServerError::Forbidden(format!(
                "not a participant of call {call_id}"
            )));
        }
        authorize(&session.call, session.state, CallCommand::Join, user)?;

        session.joined.insert(user);
        let both_in = session.joined.contains(&session.call.caller)
            && session.joined.contains(&session.call.callee);
        if session.state == CallState::Accepted && both_in {
            session.state = CallState::Connected;
            info!(call = %call_id, room = %room, "Call connected");
        }

        Ok(session.call.clone())
    }

    pub async fn room_left(&self, room: RoomId, user: UserId) {
        let call_id = {
            let rooms = self.inner.rooms.lock().unwrap_or_else(|p| p.into_inner());
            rooms.get(&room).copied()
        };
        let Some(shared) = call_id.and_then(|id| self.live(id)) else {
            return;
        };
        shared.lock().await.joined.remove(&user);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn state(&self, call_id: CallId) -> Result<CallState, ServerError> {
        let shared = self.session(call_id)?;
        let session = shared.lock().await;
        Ok(session.state)
    }

    pub fn get(&self, call_id: CallId, user: UserId) -> Result<Call, ServerError> {
        let call = self
            .inner
            .store
            .with(|db| db.get_call(call_id))
            .or_not_found("call", call_id)?;
        if !call.is_party(&user) {
            return Err(ServerError::Forbidden(format!(
                "not a participant of call {call_id}"
            )));
        }
        Ok(call)
    }

    /// The user's calls, newest first.
    pub fn history(&self, user: UserId) -> Result<Vec<Call>, ServerError> {
        Ok(self.inner.store.with(|db| db.calls_for_user(user))?)
    }

    pub fn logs(&self, user: UserId) -> Result<Vec<CallLog>, ServerError> {
        Ok(self.inner.store.with(|db| db.call_logs_for_user(user))?)
    }

    /// Rebuild sessions for calls left open by a previous process. Ringing
    /// calls get a timeout for whatever is left of their window.
    pub fn resume_open_calls(&self) -> Result<usize, ServerError> {
        let open = self.inner.store.with(|db| db.open_calls())?;
        let count = open.len();
        for call in open {
            self.adopt(call);
        }
        if count > 0 {
            info!(count, "Resumed open calls");
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Session bookkeeping
    // ------------------------------------------------------------------

    fn live(&self, call_id: CallId) -> Option<SharedSession> {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(&call_id).cloned()
    }

    /// The live session for `call_id`, rebuilt from the store if needed.
    fn session(&self, call_id: CallId) -> Result<SharedSession, ServerError> {
        if let Some(shared) = self.live(call_id) {
            return Ok(shared);
        }
        let call = self
            .inner
            .store
            .with(|db| db.get_call(call_id))
            .or_not_found("call", call_id)?;
        Ok(self.adopt(call))
    }

    /// Wrap a stored call in a session. Ended calls are not kept.
    fn adopt(&self, call: Call) -> SharedSession {
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = sessions.get(&call.id) {
            return existing.clone();
        }

        let call_id = call.id;
        let room_id = call.room_id;
        let state = CallState::from_status(call.status);
        let timeout = (state == CallState::Ringing).then(|| {
            let elapsed = (Utc::now() - call.started_at).to_std().unwrap_or_default();
            self.arm_timeout(call_id, self.inner.ring_timeout.saturating_sub(elapsed))
        });

        let shared = Arc::new(AsyncMutex::new(CallSession {
            call,
            state,
            joined: HashSet::new(),
            timeout,
        }));

        if !state.is_terminal() {
            sessions.insert(call_id, shared.clone());
            self.inner
                .rooms
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(room_id, call_id);
        }
        shared
    }

    fn retire(&self, call: &Call) {
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(&call.id);
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&call.room_id);
    }

    fn call_for_room(&self, room: RoomId) -> Result<CallId, ServerError> {
        let known = {
            let rooms = self.inner.rooms.lock().unwrap_or_else(|p| p.into_inner());
            rooms.get(&room).copied()
        };
        match known {
            Some(call_id) => Ok(call_id),
            None => Ok(self
                .inner
                .store
                .with(|db| db.call_by_room(room))
                .or_not_found("room", room)?
                .id),
        }
    }

    fn arm_timeout(&self, call_id: CallId, after: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            manager.expire(call_id).await;
        })
    }
}
