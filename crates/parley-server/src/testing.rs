//! Shared fixtures for the server's unit tests.

use chrono::Utc;
use tokio::sync::mpsc;

use parley_shared::models::User;
use parley_shared::protocol::RelayEvent;
use parley_shared::types::UserId;
use parley_store::Database;

use crate::api::AppState;
use crate::calls::CallSessionManager;
use crate::config::ServerConfig;
use crate::contacts::ContactDirectory;
use crate::messages::MessageDeliveryManager;
use crate::presence::PresenceTracker;
use crate::relay::EventRelay;
use crate::store::StoreHandle;

/// A full set of managers over one in-memory database.
pub struct Harness {
    pub state: AppState,
    pub store: StoreHandle,
    pub relay: EventRelay,
    pub calls: CallSessionManager,
    pub messages: MessageDeliveryManager,
    pub presence: PresenceTracker,
    pub contacts: ContactDirectory,
}

impl Harness {
    pub fn new() -> Self {
        let config = ServerConfig {
            database_path: ":memory:".into(),
            admin_token: Some("admin-secret".into()),
            ..Default::default()
        };
        let db = Database::open_in_memory().unwrap();
        let state = AppState::new(config, db).unwrap();
        Self {
            store: state.store.clone(),
            relay: state.relay.clone(),
            calls: state.calls.clone(),
            messages: state.messages.clone(),
            presence: state.presence.clone(),
            contacts: state.contacts.clone(),
            state,
        }
    }
}

pub fn add_user(h: &Harness, name: &str) -> User {
    let user = User {
        id: UserId::new(),
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        is_online: false,
        last_seen: None,
        created_at: Utc::now(),
    };
    h.store.with(|db| db.insert_user(&user)).unwrap();
    user
}

/// Everything queued for a connection right now.
pub fn drain(events: &mut mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
