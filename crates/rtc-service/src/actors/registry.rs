//! Connection registry.
//!
//! Maps live connections to user ids and tracks topic subscriptions. Unlike
//! the other actors the registry has no mailbox: it is shared state behind a
//! read/write lock, since every actor needs to deliver through it and
//! delivery is a read. Lookups and fan-out snapshots take the shared lock,
//! mutations take the exclusive lock. No lock is held across an await on
//! another component.
//!
//! Delivery is best-effort: an event for a user with no connection, or whose
//! outbound queue is full or closed, is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::types::{ChannelId, ConnectionId, UserId};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, instrument};

use crate::events::{PresenceChange, ServerEvent};
use crate::observability::metrics;

/// Capacity of the disconnect broadcast. A lagging actor logs the gap.
pub const DISCONNECT_CHANNEL_CAPACITY: usize = 1024;

/// Topic for room-level presence of a voice/video channel.
#[must_use]
pub fn channel_topic(channel_id: ChannelId) -> String {
    format!("channel:{channel_id}")
}

/// Topic carrying a user's online/offline changes.
#[must_use]
pub fn user_topic(user_id: UserId) -> String {
    format!("user:{user_id}")
}

/// Outbound side of one transport connection.
///
/// The transport task owns the matching receiver and writes each event to
/// the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            outbound,
        };
        (handle, receiver)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, user_id: UserId, event: ServerEvent) -> bool {
        let event_type = event.event_type();
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    target: "rtc.registry",
                    user_id = %user_id,
                    event_type,
                    "Outbound queue full, event dropped"
                );
                metrics::record_event_dropped(event_type, "queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "rtc.registry",
                    user_id = %user_id,
                    event_type,
                    "Connection closed, event dropped"
                );
                metrics::record_event_dropped(event_type, "closed");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<UserId, ConnectionHandle>,
    owners: HashMap<ConnectionId, UserId>,
    topics: HashMap<String, HashSet<UserId>>,
    memberships: HashMap<UserId, HashSet<String>>,
}

impl RegistryState {
    fn drop_memberships(&mut self, user_id: UserId) {
        let Some(topics) = self.memberships.remove(&user_id) else {
            return;
        };
        for topic in topics {
            if let Some(members) = self.topics.get_mut(&topic) {
                members.remove(&user_id);
                if members.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    disconnects: broadcast::Sender<UserId>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (disconnects, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(RegistryState::default()),
            disconnects,
        })
    }

    /// Receiver for user ids whose current connection was unregistered.
    #[must_use]
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<UserId> {
        self.disconnects.subscribe()
    }

    /// Bind `connection` to `user_id`. The most recent registration wins;
    /// a replaced connection is forgotten without a disconnect.
    #[instrument(skip_all, name = "rtc.registry.register", fields(user_id = %user_id))]
    pub async fn register(&self, user_id: UserId, connection: ConnectionHandle) {
        let count = {
            let mut state = self.state.write().await;
            state.owners.insert(connection.id(), user_id);
            if let Some(previous) = state.connections.insert(user_id, connection) {
                state.owners.remove(&previous.id());
                debug!(
                    target: "rtc.registry",
                    user_id = %user_id,
                    replaced = %previous.id(),
                    "Connection replaced"
                );
            }
            state.connections.len()
        };
        metrics::set_connections_active(count);
        info!(target: "rtc.registry", user_id = %user_id, "User connected");

        self.send_to_topic(
            &user_topic(user_id),
            ServerEvent::Change(PresenceChange {
                uid: user_id,
                online: true,
            }),
        )
        .await;
    }

    /// Remove a connection. Idempotent. Returns the user id when this was
    /// the user's current connection, in which case their subscriptions are
    /// dropped and a disconnect is broadcast to the actors.
    #[instrument(skip_all, name = "rtc.registry.unregister", fields(connection_id = %connection_id))]
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let (user_id, count) = {
            let mut state = self.state.write().await;
            let user_id = state.owners.remove(&connection_id)?;
            let is_current = state
                .connections
                .get(&user_id)
                .is_some_and(|current| current.id() == connection_id);
            if !is_current {
                return None;
            }
            state.connections.remove(&user_id);
            state.drop_memberships(user_id);
            (user_id, state.connections.len())
        };
        metrics::set_connections_active(count);
        info!(target: "rtc.registry", user_id = %user_id, "User disconnected");

        if self.disconnects.send(user_id).is_err() {
            debug!(target: "rtc.registry", user_id = %user_id, "No disconnect listeners");
        }

        self.send_to_topic(
            &user_topic(user_id),
            ServerEvent::Change(PresenceChange {
                uid: user_id,
                online: false,
            }),
        )
        .await;

        Some(user_id)
    }

    /// Deliver to one user. Returns whether the event was queued.
    pub async fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        match state.connections.get(&user_id) {
            Some(connection) => connection.deliver(user_id, event),
            None => false,
        }
    }

    /// Deliver to each listed user. Returns how many were queued.
    pub async fn send_to_users(&self, user_ids: &[UserId], event: ServerEvent) -> usize {
        let state = self.state.read().await;
        user_ids
            .iter()
            .filter(|user_id| {
                state
                    .connections
                    .get(*user_id)
                    .is_some_and(|connection| connection.deliver(**user_id, event.clone()))
            })
            .count()
    }

    /// Deliver to every registered subscriber of `topic`.
    pub async fn send_to_topic(&self, topic: &str, event: ServerEvent) -> usize {
        self.send_to_topic_filtered(topic, None, event).await
    }

    /// Deliver to every registered subscriber of `topic` except `excluded`.
    pub async fn send_to_topic_except(
        &self,
        topic: &str,
        excluded: UserId,
        event: ServerEvent,
    ) -> usize {
        self.send_to_topic_filtered(topic, Some(excluded), event)
            .await
    }

    async fn send_to_topic_filtered(
        &self,
        topic: &str,
        excluded: Option<UserId>,
        event: ServerEvent,
    ) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.topics.get(topic) else {
            return 0;
        };
        members
            .iter()
            .filter(|user_id| Some(**user_id) != excluded)
            .filter(|user_id| {
                state
                    .connections
                    .get(*user_id)
                    .is_some_and(|connection| connection.deliver(**user_id, event.clone()))
            })
            .count()
    }

    /// Current subscriber set of `topic` (empty if the topic does not exist).
    pub async fn subscriber_ids_of(&self, topic: &str) -> HashSet<UserId> {
        let state = self.state.read().await;
        state.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Subscribe a registered user to a topic. Returns `false` when the
    /// user has no connection.
    pub async fn subscribe(&self, user_id: UserId, topic: &str) -> bool {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&user_id) {
            return false;
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(user_id);
        state
            .memberships
            .entry(user_id)
            .or_default()
            .insert(topic.to_string());
        true
    }

    pub async fn unsubscribe(&self, user_id: UserId, topic: &str) {
        let mut state = self.state.write().await;
        if let Some(members) = state.topics.get_mut(topic) {
            members.remove(&user_id);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
        if let Some(topics) = state.memberships.get_mut(&user_id) {
            topics.remove(topic);
            if topics.is_empty() {
                state.memberships.remove(&user_id);
            }
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.read().await.connections.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.state.read().await.topics.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::{Empty, PeerLeft};

    async fn connect(registry: &ConnectionRegistry) -> (UserId, ConnectionId, mpsc::Receiver<ServerEvent>) {
        let user_id = UserId::new();
        let (handle, rx) = ConnectionHandle::new(16);
        let connection_id = handle.id();
        registry.register(user_id, handle).await;
        (user_id, connection_id, rx)
    }

    fn ping() -> ServerEvent {
        ServerEvent::CallLeft(Empty {})
    }

    #[tokio::test]
    async fn test_send_to_registered_user() {
        let registry = ConnectionRegistry::new();
        let (user, _, mut rx) = connect(&registry).await;

        assert!(registry.send_to_user(user, ping()).await);
        assert_eq!(rx.recv().await, Some(ping()));
    }

    #[tokio::test]
    async fn test_send_to_unknown_user_is_dropped() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_user(UserId::new(), ping()).await);
    }

    #[tokio::test]
    async fn test_most_recent_registration_wins() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (first, mut first_rx) = ConnectionHandle::new(4);
        let (second, mut second_rx) = ConnectionHandle::new(4);
        let first_id = first.id();

        registry.register(user, first).await;
        registry.register(user, second).await;
        registry.send_to_user(user, ping()).await;

        assert_eq!(second_rx.recv().await, Some(ping()));
        assert!(first_rx.try_recv().is_err());

        // Unregistering the replaced connection leaves the user online.
        let mut disconnects = registry.subscribe_disconnects();
        assert_eq!(registry.unregister(first_id).await, None);
        assert!(registry.is_online(user).await);
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_broadcasts_once() {
        let registry = ConnectionRegistry::new();
        let mut disconnects = registry.subscribe_disconnects();
        let (user, connection_id, _rx) = connect(&registry).await;

        assert_eq!(registry.unregister(connection_id).await, Some(user));
        assert_eq!(registry.unregister(connection_id).await, None);

        assert_eq!(disconnects.recv().await.unwrap(), user);
        assert!(disconnects.try_recv().is_err());
        assert!(!registry.is_online(user).await);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_topic_delivery_only_reaches_subscribers() {
        let registry = ConnectionRegistry::new();
        let (alice, _, mut alice_rx) = connect(&registry).await;
        let (bob, _, mut bob_rx) = connect(&registry).await;
        let (_carol, _, mut carol_rx) = connect(&registry).await;
        let topic = channel_topic(ChannelId::new());

        assert!(registry.subscribe(alice, &topic).await);
        assert!(registry.subscribe(bob, &topic).await);

        assert_eq!(registry.send_to_topic(&topic, ping()).await, 2);
        assert_eq!(alice_rx.recv().await, Some(ping()));
        assert_eq!(bob_rx.recv().await, Some(ping()));
        assert!(carol_rx.try_recv().is_err());

        let event = ServerEvent::ChannelWebrtcLeft(PeerLeft { uid: alice });
        assert_eq!(registry.send_to_topic_except(&topic, alice, event.clone()).await, 1);
        assert_eq!(bob_rx.recv().await, Some(event));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_user_cannot_subscribe() {
        let registry = ConnectionRegistry::new();
        let topic = channel_topic(ChannelId::new());

        assert!(!registry.subscribe(UserId::new(), &topic).await);
        assert!(registry.subscriber_ids_of(&topic).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_topic_is_removed() {
        let registry = ConnectionRegistry::new();
        let (alice, connection_id, _rx) = connect(&registry).await;
        let (bob, _, _bob_rx) = connect(&registry).await;
        let first = channel_topic(ChannelId::new());
        let second = channel_topic(ChannelId::new());

        registry.subscribe(alice, &first).await;
        registry.subscribe(alice, &second).await;
        registry.subscribe(bob, &second).await;
        assert_eq!(registry.topic_count().await, 2);

        registry.unsubscribe(alice, &first).await;
        assert_eq!(registry.topic_count().await, 1);

        // Disconnect drops the remaining membership but keeps bob's topic.
        registry.unregister(connection_id).await;
        assert_eq!(
            registry.subscriber_ids_of(&second).await,
            HashSet::from([bob])
        );
    }

    #[tokio::test]
    async fn test_presence_changes_reach_watchers() {
        let registry = ConnectionRegistry::new();
        let (watcher, _, mut watcher_rx) = connect(&registry).await;
        let user = UserId::new();
        registry.subscribe(watcher, &user_topic(user)).await;

        let (handle, _user_rx) = ConnectionHandle::new(4);
        let connection_id = handle.id();
        registry.register(user, handle).await;
        registry.unregister(connection_id).await;

        assert_eq!(
            watcher_rx.recv().await,
            Some(ServerEvent::Change(PresenceChange {
                uid: user,
                online: true
            }))
        );
        assert_eq!(
            watcher_rx.recv().await,
            Some(ServerEvent::Change(PresenceChange {
                uid: user,
                online: false
            }))
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (handle, mut rx) = ConnectionHandle::new(1);
        registry.register(user, handle).await;

        assert!(registry.send_to_user(user, ping()).await);
        assert!(!registry.send_to_user(user, ping()).await);

        assert_eq!(rx.recv().await, Some(ping()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_users_counts_deliveries() {
        let registry = ConnectionRegistry::new();
        let (alice, _, _a) = connect(&registry).await;
        let (bob, _, _b) = connect(&registry).await;

        let delivered = registry
            .send_to_users(&[alice, bob, UserId::new()], ping())
            .await;
        assert_eq!(delivered, 2);
    }
}
