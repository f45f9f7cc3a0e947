//! Presence tracker.
//!
//! Driven only by relay connect/disconnect. A principal is online while it
//! has at least one live connection. Changes are persisted before they are
//! broadcast; if the write fails nothing is sent.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use tracing::{debug, info, warn};

use parley_shared::models::Presence;
use parley_shared::protocol::RelayEvent;
use parley_shared::types::{Channel, UserId};

use crate::error::{OrNotFound, ServerError};
use crate::locks::KeyedLocks;
use crate::relay::EventRelay;
use crate::store::StoreHandle;

/// Who is told about a principal's presence changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceScope {
    /// Every connected principal.
    Global,
    /// Only principals sharing a chat with the subject or holding it in
    /// their saved contacts.
    Contacts,
}

impl FromStr for PresenceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "contacts" => Ok(Self::Contacts),
            other => Err(format!("unknown presence scope: {other}")),
        }
    }
}

impl fmt::Display for PresenceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Contacts => f.write_str("contacts"),
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: StoreHandle,
    relay: EventRelay,
    scope: PresenceScope,
    locks: KeyedLocks<UserId>,
}

impl PresenceTracker {
    pub fn new(store: StoreHandle, relay: EventRelay, scope: PresenceScope) -> Self {
        Self {
            store,
            relay,
            scope,
            locks: KeyedLocks::new(),
        }
    }

    /// Called after a connection registered. Only the principal's first
    /// connection changes presence.
    pub async fn connected(
        &self,
        principal: UserId,
        first_for_principal: bool,
    ) -> Result<Option<Presence>, ServerError> {
        if !first_for_principal {
            return Ok(None);
        }
        self.transition(principal, true).await
    }

    /// Called after a connection closed. Only the principal's last
    /// connection changes presence.
    pub async fn disconnected(
        &self,
        principal: UserId,
        last_for_principal: bool,
    ) -> Result<Option<Presence>, ServerError> {
        if !last_for_principal {
            return Ok(None);
        }
        self.transition(principal, false).await
    }

    pub fn status(&self, user: UserId) -> Result<Presence, ServerError> {
        self.store
            .with(|db| db.get_presence(user))
            .or_not_found("user", user)
    }

    pub(crate) fn purge_idle_locks(&self) -> usize {
        self.locks.purge_idle()
    }

    async fn transition(
        &self,
        principal: UserId,
        online: bool,
    ) -> Result<Option<Presence>, ServerError> {
        let _guard = self.locks.lock(principal).await;

        // A connect and a disconnect of the same principal can race; the
        // relay's live connection set decides which one still applies.
        if self.relay.is_online(principal).await != online {
            debug!(principal = %principal, online, "Presence change superseded");
            return Ok(None);
        }

        let presence = match self
            .store
            .with(|db| db.set_presence(principal, online, Utc::now()))
            .or_not_found("user", principal)
        {
            Ok(presence) => presence,
            Err(e) => {
                warn!(principal = %principal, online, error = %e, "Presence not persisted, not broadcasting");
                return Err(e);
            }
        };

        let event = RelayEvent::UserStatusChanged(presence.clone());
        let delivered = match self.scope {
            PresenceScope::Global => self.relay.broadcast_all(event, Some(principal)).await,
            PresenceScope::Contacts => {
                let contacts: Vec<Channel> = self
                    .store
                    .with(|db| db.contacts_of(principal))?
                    .into_iter()
                    .map(Channel::User)
                    .collect();
                self.relay.publish_many(&contacts, event).await
            }
        };

        info!(
            principal = %principal,
            online,
            scope = %self.scope,
            delivered,
            "Presence changed"
        );
        Ok(Some(presence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_user, drain, Harness};
    use parley_shared::protocol::ContactDraft;

    #[tokio::test]
    async fn test_first_connect_broadcasts_online() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let mut watcher = h.relay.connect(bob.id).await;

        let sub = h.relay.connect(ada.id).await;
        let presence = h
            .presence
            .connected(ada.id, sub.first_for_principal)
            .await
            .unwrap()
            .unwrap();
        assert!(presence.is_online);

        let events = drain(&mut watcher.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RelayEvent::UserStatusChanged(p) if p.user_id == ada.id && p.is_online
        ));
        assert!(h.presence.status(ada.id).unwrap().is_online);
    }

    #[tokio::test]
    async fn test_second_device_does_not_rebroadcast() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let mut watcher = h.relay.connect(bob.id).await;

        let first = h.relay.connect(ada.id).await;
        h.presence.connected(ada.id, first.first_for_principal).await.unwrap();
        let second = h.relay.connect(ada.id).await;
        assert!(h
            .presence
            .connected(ada.id, second.first_for_principal)
            .await
            .unwrap()
            .is_none());

        let departure = h.relay.disconnect(second.id).await.unwrap();
        assert!(h
            .presence
            .disconnected(ada.id, departure.last_for_principal)
            .await
            .unwrap()
            .is_none());
        assert_eq!(drain(&mut watcher.events).len(), 1);
    }

    #[tokio::test]
    async fn test_last_disconnect_goes_offline() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let mut watcher = h.relay.connect(bob.id).await;

        let sub = h.relay.connect(ada.id).await;
        h.presence.connected(ada.id, true).await.unwrap();
        let departure = h.relay.disconnect(sub.id).await.unwrap();
        let presence = h
            .presence
            .disconnected(ada.id, departure.last_for_principal)
            .await
            .unwrap()
            .unwrap();

        assert!(!presence.is_online);
        assert!(presence.last_seen.is_some());
        assert_eq!(drain(&mut watcher.events).len(), 2);
        assert!(!h.presence.status(ada.id).unwrap().is_online);
    }

    #[tokio::test]
    async fn test_unknown_principal_is_not_broadcast() {
        let h = Harness::new();
        let bob = add_user(&h, "Bob");
        let mut watcher = h.relay.connect(bob.id).await;

        let ghost = UserId::new();
        h.relay.connect(ghost).await;
        let result = h.presence.connected(ghost, true).await;

        assert!(matches!(result, Err(ServerError::NotFound { .. })));
        assert!(drain(&mut watcher.events).is_empty());
    }

    #[tokio::test]
    async fn test_contacts_scope_limits_fan_out() {
        let h = Harness::new();
        let presence = PresenceTracker::new(h.store.clone(), h.relay.clone(), PresenceScope::Contacts);
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let eve = add_user(&h, "Eve");
        h.messages.create_chat(ada.id, vec![bob.id], None).await.unwrap();

        let mut bob_sub = h.relay.connect(bob.id).await;
        let mut eve_sub = h.relay.connect(eve.id).await;
        h.relay.connect(ada.id).await;
        presence.connected(ada.id, true).await.unwrap();

        assert_eq!(drain(&mut bob_sub.events).len(), 1);
        assert!(drain(&mut eve_sub.events).is_empty());
        assert!(h.relay.is_member(bob_sub.id, Channel::User(bob.id)).await);
    }

    #[tokio::test]
    async fn test_contacts_scope_reaches_saved_contact_owners() {
        let h = Harness::new();
        let presence = PresenceTracker::new(h.store.clone(), h.relay.clone(), PresenceScope::Contacts);
        let ada = add_user(&h, "Ada");
        let eve = add_user(&h, "Eve");
        let draft = ContactDraft {
            name: "Ada".into(),
            phone: "+1 555 0100".into(),
            email: ada.email.clone(),
        };
        h.contacts.add(eve.id, draft).unwrap();

        let mut eve_sub = h.relay.connect(eve.id).await;
        h.relay.connect(ada.id).await;
        presence.connected(ada.id, true).await.unwrap();

        assert_eq!(drain(&mut eve_sub.events).len(), 1);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("Contacts".parse::<PresenceScope>().unwrap(), PresenceScope::Contacts);
        assert!("friends".parse::<PresenceScope>().is_err());
    }
}
