use crate::error::ClientError;

/// Where the client connects and with which session token.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server, e.g. `https://chat.example.org`.
    pub server_url: String,
    pub token: String,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    /// The relay gateway URL with the token in the query string.
    pub fn ws_url(&self) -> Result<String, ClientError> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::InvalidUrl(self.server_url.clone()));
        };
        Ok(format!("{base}/ws?token={}", self.token))
    }
}
