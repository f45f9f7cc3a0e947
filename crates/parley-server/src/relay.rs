//! Event relay: addressable publish/subscribe over live connections.
//!
//! Every connection belongs to its principal's channel and to whatever chat
//! and call rooms it joins. Delivery is at most once: each connection has a
//! bounded queue and an event that does not fit is dropped for that
//! connection only. Publishers never wait on subscribers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use parley_shared::protocol::RelayEvent;
use parley_shared::types::{Channel, UserId};

/// Identifies one live connection of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a new connection receives from [`EventRelay::connect`].
pub struct Subscription {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<RelayEvent>,
    /// True if the principal had no other live connection.
    pub first_for_principal: bool,
}

/// What [`EventRelay::disconnect`] reports about a closed connection.
#[derive(Debug)]
pub struct Departure {
    pub principal: UserId,
    /// True if this was the principal's last live connection.
    pub last_for_principal: bool,
    /// Rooms the connection was still in, principal channel excluded.
    pub rooms: Vec<Channel>,
}

struct Connection {
    principal: UserId,
    tx: mpsc::Sender<RelayEvent>,
    channels: HashSet<Channel>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl Registry {
    fn deliver<'a>(&self, targets: impl IntoIterator<Item = &'a ConnectionId>, event: &RelayEvent) -> usize {
        let mut delivered = 0;
        for id in targets {
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            match conn.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        conn = %id,
                        principal = %conn.principal,
                        event = event.name(),
                        "Dropping event for slow subscriber"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn = %id, event = event.name(), "Dropping event for closed connection");
                }
            }
        }
        delivered
    }

    fn members(&self, channel: &Channel) -> impl Iterator<Item = &ConnectionId> {
        self.channels.get(channel).into_iter().flatten()
    }
}

#[derive(Clone)]
pub struct EventRelay {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl EventRelay {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Register a connection for an already authenticated principal.
    pub async fn connect(&self, principal: UserId) -> Subscription {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        let own = Channel::User(principal);

        let mut reg = self.registry.write().await;
        let members = reg.channels.entry(own).or_default();
        let first_for_principal = members.is_empty();
        members.insert(id);
        reg.connections.insert(
            id,
            Connection {
                principal,
                tx,
                channels: HashSet::from([own]),
            },
        );

        info!(
            conn = %id,
            principal = %principal,
            first = first_for_principal,
            connections = reg.connections.len(),
            "Relay connection opened"
        );

        Subscription {
            id,
            events: rx,
            first_for_principal,
        }
    }

    /// Add a connection to a channel. Returns false if it was already a
    /// member or the connection is gone.
    pub async fn join(&self, conn: ConnectionId, channel: Channel) -> bool {
        let mut reg = self.registry.write().await;
        let Some(entry) = reg.connections.get_mut(&conn) else {
            return false;
        };
        if !entry.channels.insert(channel) {
            return false;
        }
        reg.channels.entry(channel).or_default().insert(conn);
        debug!(conn = %conn, channel = %channel, "Joined channel");
        true
    }

    /// Remove a connection from a channel. Returns false if it was not a
    /// member. A connection cannot leave its own principal channel.
    pub async fn leave(&self, conn: ConnectionId, channel: Channel) -> bool {
        let mut reg = self.registry.write().await;
        let Some(entry) = reg.connections.get_mut(&conn) else {
            return false;
        };
        if channel == Channel::User(entry.principal) || !entry.channels.remove(&channel) {
            return false;
        }
        remove_member(&mut reg.channels, &channel, conn);
        debug!(conn = %conn, channel = %channel, "Left channel");
        true
    }

    /// Drop a connection and all its memberships.
    pub async fn disconnect(&self, conn: ConnectionId) -> Option<Departure> {
        let mut reg = self.registry.write().await;
        let entry = reg.connections.remove(&conn)?;

        let own = Channel::User(entry.principal);
        let mut rooms = Vec::new();
        for channel in &entry.channels {
            remove_member(&mut reg.channels, channel, conn);
            if *channel != own {
                rooms.push(*channel);
            }
        }
        let last_for_principal = !reg.channels.contains_key(&own);

        info!(
            conn = %conn,
            principal = %entry.principal,
            last = last_for_principal,
            connections = reg.connections.len(),
            "Relay connection closed"
        );

        Some(Departure {
            principal: entry.principal,
            last_for_principal,
            rooms,
        })
    }

    /// Deliver to every member of `channel`. Returns the number of
    /// connections the event was queued for.
    pub async fn publish(&self, channel: Channel, event: RelayEvent) -> usize {
        let reg = self.registry.read().await;
        reg.deliver(reg.members(&channel), &event)
    }

    /// Deliver to every member of `channel` except `except`.
    pub async fn publish_except(&self, channel: Channel, event: RelayEvent, except: ConnectionId) -> usize {
        let reg = self.registry.read().await;
        reg.deliver(reg.members(&channel).filter(|id| **id != except), &event)
    }

    /// Deliver once to every connection that is in any of `channels`.
    pub async fn publish_many(&self, channels: &[Channel], event: RelayEvent) -> usize {
        let reg = self.registry.read().await;
        let mut targets: Vec<ConnectionId> = channels
            .iter()
            .flat_map(|c| reg.members(c).copied())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        reg.deliver(&targets, &event)
    }

    /// Deliver to the connections of `principal` that are inside `channel`.
    pub async fn publish_to_principal_in(
        &self,
        channel: Channel,
        principal: UserId,
        event: RelayEvent,
    ) -> usize {
        let reg = self.registry.read().await;
        let targets = reg
            .members(&channel)
            .filter(|id| reg.connections.get(id).map(|c| c.principal) == Some(principal));
        reg.deliver(targets, &event)
    }

    /// Deliver to every connection, optionally skipping one principal.
    pub async fn broadcast_all(&self, event: RelayEvent, except: Option<UserId>) -> usize {
        let reg = self.registry.read().await;
        let targets = reg
            .connections
            .iter()
            .filter(|(_, c)| Some(c.principal) != except)
            .map(|(id, _)| id);
        reg.deliver(targets, &event)
    }

    pub async fn members(&self, channel: Channel) -> Vec<ConnectionId> {
        let reg = self.registry.read().await;
        let mut members: Vec<_> = reg.members(&channel).copied().collect();
        members.sort_unstable();
        members
    }

    pub async fn principals_in(&self, channel: Channel) -> HashSet<UserId> {
        let reg = self.registry.read().await;
        reg.members(&channel)
            .filter_map(|id| reg.connections.get(id).map(|c| c.principal))
            .collect()
    }

    pub async fn is_member(&self, conn: ConnectionId, channel: Channel) -> bool {
        let reg = self.registry.read().await;
        reg.connections
            .get(&conn)
            .is_some_and(|c| c.channels.contains(&channel))
    }

    pub async fn is_online(&self, principal: UserId) -> bool {
        let reg = self.registry.read().await;
        reg.channels.contains_key(&Channel::User(principal))
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }
}

fn remove_member(
    channels: &mut HashMap<Channel, HashSet<ConnectionId>>,
    channel: &Channel,
    conn: ConnectionId,
) {
    let now_empty = match channels.get_mut(channel) {
        Some(members) => {
            members.remove(&conn);
            members.is_empty()
        }
        None => false,
    };
    if now_empty {
        channels.remove(channel);
    }
}
