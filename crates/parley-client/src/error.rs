use thiserror::Error;

use parley_shared::error::CommandFailure;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server refused the command.
    #[error("Server rejected request: {0}")]
    Server(CommandFailure),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Relay connection is closed")]
    Disconnected,

    #[error("Another call is already in progress")]
    Busy,

    #[error("No {0} call to act on")]
    NoCall(&'static str),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),
}
