//! Media negotiation over the relay's `signal` command.
//!
//! The server treats payloads as opaque JSON and only checks room
//! membership. This module gives them a shape: SDP offers and answers, ICE
//! candidates and hangups, exchanged between the two parties of a call.

use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_shared::protocol::{ClientCommand, SignalRelay};
use parley_shared::types::{RoomId, UserId};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    OfferSent,
    OfferReceived,
    Connected,
    Closed,
}

pub struct SignalingSession {
    pub local_user: UserId,
    pub remote_user: UserId,
    pub room_id: RoomId,
    pub state: SignalingState,
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    pub ice_candidates: Vec<String>,
}

impl SignalingSession {
    pub fn new(local_user: UserId, remote_user: UserId, room_id: RoomId) -> Self {
        Self {
            local_user,
            remote_user,
            room_id,
            state: SignalingState::Idle,
            local_sdp: None,
            remote_sdp: None,
            ice_candidates: Vec::new(),
        }
    }

    pub fn create_offer(&mut self, sdp: String) -> Result<ClientCommand, ClientError> {
        self.local_sdp = Some(sdp.clone());
        self.state = SignalingState::OfferSent;
        debug!(remote = %self.remote_user.short(), "Creating SDP offer");
        self.command(SignalPayload::Offer { sdp })
    }

    pub fn create_answer(&mut self, sdp: String) -> Result<ClientCommand, ClientError> {
        self.local_sdp = Some(sdp.clone());
        self.state = SignalingState::Connected;
        debug!(remote = %self.remote_user.short(), "Creating SDP answer");
        self.command(SignalPayload::Answer { sdp })
    }

    pub fn create_ice_candidate(&mut self, candidate: String) -> Result<ClientCommand, ClientError> {
        self.ice_candidates.push(candidate.clone());
        self.command(SignalPayload::IceCandidate { candidate })
    }

    pub fn hangup(&mut self) -> Result<ClientCommand, ClientError> {
        self.state = SignalingState::Closed;
        self.command(SignalPayload::Hangup)
    }

    /// React to a relayed signal. Signals from anyone but the remote party,
    /// or for another room, are ignored.
    pub fn handle_signal(&mut self, signal: &SignalRelay) -> Result<SignalingAction, ClientError> {
        if signal.from != self.remote_user || signal.room_id != self.room_id {
            return Ok(SignalingAction::Ignore);
        }
        let payload: SignalPayload = serde_json::from_value(signal.payload.clone())
            .map_err(|e| ClientError::InvalidSignal(e.to_string()))?;

        let action = match payload {
            SignalPayload::Offer { sdp } => {
                self.remote_sdp = Some(sdp);
                self.state = SignalingState::OfferReceived;
                debug!(from = %signal.from.short(), "Received SDP offer");
                SignalingAction::CreateAnswer
            }
            SignalPayload::Answer { sdp } => {
                self.remote_sdp = Some(sdp);
                self.state = SignalingState::Connected;
                debug!(from = %signal.from.short(), "Received SDP answer");
                SignalingAction::SetRemoteDescription
            }
            SignalPayload::IceCandidate { candidate } => {
                debug!(from = %signal.from.short(), "Received ICE candidate");
                SignalingAction::AddIceCandidate(candidate)
            }
            SignalPayload::Hangup => {
                self.state = SignalingState::Closed;
                debug!(from = %signal.from.short(), "Received hangup");
                SignalingAction::Close
            }
        };
        Ok(action)
    }

    fn command(&self, payload: SignalPayload) -> Result<ClientCommand, ClientError> {
        Ok(ClientCommand::Signal {
            room_id: self.room_id,
            to: Some(self.remote_user),
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SignalingAction {
    CreateAnswer,
    SetRemoteDescription,
    AddIceCandidate(String),
    Close,
    Ignore,
}
