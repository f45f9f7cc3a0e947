/// Protocol version reported by `/info`
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Seconds a call may ring before the server cancels it
pub const RING_TIMEOUT_SECS: u64 = 30;

/// Content stored in place of a soft-deleted message
pub const DELETED_MESSAGE_TOMBSTONE: &str = "This message was deleted";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Outbound events buffered per relay connection before drops start
pub const RELAY_QUEUE_DEPTH: usize = 256;

/// Default session token lifetime (24 hours)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 86_400;

/// Longest session token lifetime the server will issue (one year)
pub const MAX_TOKEN_TTL_SECS: i64 = 365 * 86_400;

/// Seconds a WebSocket client has to authenticate after upgrading
pub const AUTH_HANDSHAKE_SECS: u64 = 10;

/// Maximum length of a reaction emoji, in bytes
pub const MAX_EMOJI_BYTES: usize = 32;

/// Most users returned by one contact search
pub const MAX_CONTACT_SEARCH_RESULTS: usize = 25;
