use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories returned to endpoints at the command boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidTransition,
    Authentication,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::InvalidTransition => "invalid_transition",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a state machine refused a command.
///
/// `superseded` is set when the actor was entitled to issue the command but
/// the entity had already moved past the state where it was legal, i.e. the
/// actor lost a race. Endpoints reconcile from the next event in that case
/// instead of reporting an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub entity: String,
    pub id: String,
    pub state: String,
    pub command: String,
    pub superseded: bool,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} {} {} in state '{}'",
            self.command, self.entity, self.id, self.state
        )?;
        if self.superseded {
            f.write_str(" (superseded)")?;
        }
        Ok(())
    }
}

/// Structured failure sent back to the endpoint that issued a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct CommandFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub superseded: bool,
}

impl CommandFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            superseded: false,
        }
    }

    /// True when the failure means "the entity is no longer in the state you
    /// think it is in" rather than a caller bug.
    pub fn is_stale_state(&self) -> bool {
        match self.kind {
            ErrorKind::NotFound => true,
            ErrorKind::InvalidTransition => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token encoding is invalid")]
    Malformed,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    BadSignature,

    #[error("Signing key is invalid")]
    InvalidKey,
}
