//! # parley-server
//!
//! Chat and call coordination server.
//!
//! This binary provides:
//! - **Event relay** addressing live connections by principal, chat room
//!   and call room, with at-most-once delivery
//! - **Call session manager** running the call state machine, including
//!   the ring timeout and the transport room side protocol
//! - **Message delivery manager** for chats, read receipts, reactions,
//!   edits and soft deletes
//! - **Presence tracking** driven by relay connect/disconnect
//! - **REST API and WebSocket gateway** (axum)

mod api;
mod auth;
mod calls;
mod config;
mod contacts;
mod error;
mod gateway;
mod locks;
mod messages;
mod presence;
mod relay;
mod store;

#[cfg(test)]
mod testing;

use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        presence_scope = %config.presence_scope,
        ring_timeout_secs = config.ring_timeout.as_secs(),
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Open the store
    // -----------------------------------------------------------------------
    let db = Database::open(&config.database_path)?;

    // Nobody is connected yet, whatever the last run left behind.
    let reset = db.reset_presence(Utc::now())?;
    if reset > 0 {
        info!(count = reset, "Marked stale online users offline");
    }

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState::new(config, db)?;

    // Calls that were ringing or in progress when the last process stopped
    app_state.calls.resume_open_calls()?;

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic cleanup of per-entity locks nobody holds (every 5 minutes)
    let messages = app_state.messages.clone();
    let presence = app_state.presence.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let purged = messages.purge_idle_locks() + presence.purge_idle_locks();
            if purged > 0 {
                tracing::debug!(purged, "Purged idle entity locks");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
