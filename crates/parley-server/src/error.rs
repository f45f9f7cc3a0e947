use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::error::{CommandFailure, ErrorKind, Rejection};
use parley_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(Rejection),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The structured failure returned to the endpoint. Collaborator
    /// failures are reported without their details.
    pub fn to_failure(&self) -> CommandFailure {
        let kind = self.kind();
        let message = match kind {
            ErrorKind::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        };
        CommandFailure {
            kind,
            message,
            superseded: matches!(self, Self::InvalidTransition(r) if r.superseded),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log collaborator failures once, where they leave the server.
    pub fn log_if_internal(&self) {
        if self.kind() == ErrorKind::Internal {
            tracing::error!(error = %self, "Request failed");
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        self.log_if_internal();

        let failure = self.to_failure();
        let body = serde_json::json!({
            "error": failure.message,
            "kind": failure.kind,
            "superseded": failure.superseded,
        });

        (self.status(), axum::Json(body)).into_response()
    }
}

/// Attach the entity name to a store lookup that may miss.
pub trait OrNotFound<T> {
    fn or_not_found(self, entity: &'static str, id: impl Display) -> Result<T, ServerError>;
}

impl<T> OrNotFound<T> for Result<T, StoreError> {
    fn or_not_found(self, entity: &'static str, id: impl Display) -> Result<T, ServerError> {
        self.map_err(|e| match e {
            StoreError::NotFound => ServerError::not_found(entity, id),
            other => ServerError::Store(other),
        })
    }
}
