//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    APP_NAME, DEFAULT_HTTP_PORT, DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS, RELAY_QUEUE_DEPTH,
    RING_TIMEOUT_SECS,
};

use crate::presence::PresenceScope;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the REST API and WebSocket gateway.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file, or `:memory:`.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: String,

    /// Ed25519 seed used to sign session tokens (hex, 64 chars).
    /// Env: `TOKEN_SIGNING_KEY`
    /// Default: none, a random key is generated per process.
    pub token_signing_key: Option<String>,

    /// Lifetime of issued session tokens, in seconds (1 to one year).
    /// Env: `TOKEN_TTL_SECS`
    pub token_ttl_secs: i64,

    /// How long a call may ring before it is cancelled.
    /// Env: `RING_TIMEOUT_SECS`
    pub ring_timeout: Duration,

    /// Per-connection outbound event queue depth.
    /// Env: `RELAY_BUFFER`
    pub relay_buffer: usize,

    /// Who receives `user_status_changed`.
    /// Env: `PRESENCE_SCOPE` (`global` | `contacts`)
    pub presence_scope: PresenceScope,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: "./parley.db".to_string(),
            token_signing_key: None,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            ring_timeout: Duration::from_secs(RING_TIMEOUT_SECS),
            relay_buffer: RELAY_QUEUE_DEPTH,
            presence_scope: PresenceScope::Global,
            admin_token: None,
            instance_name: APP_NAME.to_string(),
        }
    }
}

// Secrets stay out of the startup log line.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("token_signing_key", &self.token_signing_key.as_ref().map(|_| "<set>"))
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("ring_timeout", &self.ring_timeout)
            .field("relay_buffer", &self.relay_buffer)
            .field("presence_scope", &self.presence_scope)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = path;
        }

        if let Some(key) = lookup("TOKEN_SIGNING_KEY") {
            if key.trim().len() == 64 {
                config.token_signing_key = Some(key.trim().to_string());
            } else {
                tracing::warn!("Invalid TOKEN_SIGNING_KEY (expected 64 hex chars), ignoring");
            }
        }

        parse_into(&lookup, "TOKEN_TTL_SECS", &mut config.token_ttl_secs);
        if !(1..=MAX_TOKEN_TTL_SECS).contains(&config.token_ttl_secs) {
            tracing::warn!(
                value = config.token_ttl_secs,
                max = MAX_TOKEN_TTL_SECS,
                "TOKEN_TTL_SECS out of range, using default"
            );
            config.token_ttl_secs = DEFAULT_TOKEN_TTL_SECS;
        }

        let mut ring_secs = config.ring_timeout.as_secs();
        parse_into(&lookup, "RING_TIMEOUT_SECS", &mut ring_secs);
        config.ring_timeout = Duration::from_secs(ring_secs);

        parse_into(&lookup, "RELAY_BUFFER", &mut config.relay_buffer);
        if config.relay_buffer == 0 {
            tracing::warn!("RELAY_BUFFER must be positive, using default");
            config.relay_buffer = RELAY_QUEUE_DEPTH;
        }

        parse_into(&lookup, "PRESENCE_SCOPE", &mut config.presence_scope);

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `slot` with the parsed variable, warning and keeping the
/// default if it does not parse.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(var = name, value = %raw, "Invalid value, using default"),
    }
}
