use dashmap::DashMap;
use huddle_core::models::{CallId, ConnectionId, RoomId, UserId};
use huddle_core::service::PresenceView;
use huddle_proto::ServerMessage;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Bounded outbound queue of one connection
pub type Outlet = mpsc::Sender<ServerMessage>;

/// Namespaced delivery group
///
/// A connection may belong to many groups at once: every room it joined, the
/// call it participates in, and its owner's private group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Room(RoomId),
    Call(CallId),
    User(UserId),
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room:{id}"),
            Self::Call(id) => write!(f, "call:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Attached {
    user_id: UserId,
    outlet: Outlet,
}

/// In-memory fan-out of server events to connection groups
///
/// Delivery is best effort: a closed or saturated connection is skipped and
/// left in place. Removing dead connections is the registry's job.
#[derive(Clone)]
pub struct RoomBroadcastRouter {
    /// connection -> outbound queue
    outlets: Arc<DashMap<ConnectionId, Attached>>,

    /// group -> member connections, in join order
    groups: Arc<DashMap<GroupKey, Vec<ConnectionId>>>,

    /// connection -> groups it belongs to, for cleanup
    memberships: Arc<DashMap<ConnectionId, HashSet<GroupKey>>>,

    presence: Arc<dyn PresenceView>,
}

impl RoomBroadcastRouter {
    pub fn new(presence: Arc<dyn PresenceView>) -> Self {
        Self {
            outlets: Arc::new(DashMap::new()),
            groups: Arc::new(DashMap::new()),
            memberships: Arc::new(DashMap::new()),
            presence,
        }
    }

    /// Bind a connection's outbound queue and join its private user group
    pub fn attach(&self, connection_id: ConnectionId, user_id: UserId, outlet: Outlet) {
        self.outlets.insert(
            connection_id.clone(),
            Attached {
                user_id: user_id.clone(),
                outlet,
            },
        );
        self.join(&connection_id, GroupKey::User(user_id));
    }

    /// Drop a connection's outbound queue and every group membership
    pub fn detach(&self, connection_id: &ConnectionId) {
        self.outlets.remove(connection_id);
        if let Some((_, keys)) = self.memberships.remove(connection_id) {
            for key in keys {
                self.remove_member(&key, connection_id);
            }
        }
        debug!(connection_id = %connection_id, "Connection detached from router");
    }

    /// Drop only the outbound queue so the transport closes
    ///
    /// Group memberships stay until `detach`; nothing is delivered to the
    /// connection in between.
    pub fn evict(&self, connection_id: &ConnectionId) -> bool {
        let evicted = self.outlets.remove(connection_id).is_some();
        if evicted {
            debug!(connection_id = %connection_id, "Connection evicted");
        }
        evicted
    }

    /// Add a connection to a group; returns false if it was already a member
    pub fn join(&self, connection_id: &ConnectionId, key: GroupKey) -> bool {
        let inserted = self
            .memberships
            .entry(connection_id.clone())
            .or_default()
            .insert(key.clone());
        if !inserted {
            return false;
        }

        self.groups
            .entry(key.clone())
            .or_default()
            .push(connection_id.clone());

        debug!(connection_id = %connection_id, group = %key, "Connection joined group");
        true
    }

    /// Remove a connection from a group
    pub fn leave(&self, connection_id: &ConnectionId, key: &GroupKey) {
        if let Some(mut keys) = self.memberships.get_mut(connection_id) {
            keys.remove(key);
        }
        self.remove_member(key, connection_id);
        debug!(connection_id = %connection_id, group = %key, "Connection left group");
    }

    /// Drop a group and everyone in it
    pub fn dissolve(&self, key: &GroupKey) {
        if let Some((_, members)) = self.groups.remove(key) {
            for connection_id in &members {
                if let Some(mut keys) = self.memberships.get_mut(connection_id) {
                    keys.remove(key);
                }
            }
            info!(group = %key, members = members.len(), "Group dissolved");
        }
    }

    fn remove_member(&self, key: &GroupKey, connection_id: &ConnectionId) {
        if let Some(mut members) = self.groups.get_mut(key) {
            members.retain(|id| id != connection_id);
        }
        if self
            .groups
            .remove_if(key, |_, members| members.is_empty())
            .is_some()
        {
            debug!(group = %key, "Group has no more members, removed");
        }
    }

    /// Send to every connection in a group except `exclude`
    pub fn broadcast(
        &self,
        key: &GroupKey,
        message: &ServerMessage,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        self.broadcast_many(std::slice::from_ref(key), message, exclude)
    }

    /// Send once per connection across the union of several groups
    pub fn broadcast_many(
        &self,
        keys: &[GroupKey],
        message: &ServerMessage,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for key in keys {
            if let Some(members) = self.groups.get(key) {
                for connection_id in members.iter() {
                    if Some(connection_id) != exclude && seen.insert(connection_id.clone()) {
                        targets.push(connection_id.clone());
                    }
                }
            }
        }

        let sent_count = targets
            .iter()
            .filter(|connection_id| self.deliver(connection_id, message).is_ok())
            .count();

        if sent_count > 0 {
            debug!(
                groups = keys.len(),
                sent_count,
                event_type = message.name(),
                "Event broadcast complete"
            );
        }
        sent_count
    }

    /// Send to one connection, reporting failure
    pub fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        message: &ServerMessage,
    ) -> Result<()> {
        self.deliver(connection_id, message)
    }

    /// Send to every live connection of a user, resolved through the registry
    pub fn send_to_user(&self, user_id: &UserId, message: &ServerMessage) -> usize {
        self.presence
            .connections_of(user_id)
            .iter()
            .filter(|connection_id| self.deliver(connection_id, message).is_ok())
            .count()
    }

    fn deliver(&self, connection_id: &ConnectionId, message: &ServerMessage) -> Result<()> {
        let Some(attached) = self.outlets.get(connection_id) else {
            return Err(Error::NotAttached(connection_id.clone()));
        };

        match attached.outlet.try_send(message.clone()) {
            Ok(()) => {
                debug!(
                    connection_id = %connection_id,
                    user_id = %attached.user_id,
                    event_type = message.name(),
                    "Event sent to client"
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    user_id = %attached.user_id,
                    event_type = message.name(),
                    "Outbound buffer full, dropping event"
                );
                Err(Error::Backpressure(connection_id.clone()))
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    connection_id = %connection_id,
                    event_type = message.name(),
                    "Skipping closed connection"
                );
                Err(Error::Closed(connection_id.clone()))
            }
        }
    }

    /// Member connections of a group, in join order
    #[must_use]
    pub fn members(&self, key: &GroupKey) -> Vec<ConnectionId> {
        self.groups
            .get(key)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Distinct users with a connection in a group, in join order
    #[must_use]
    pub fn users_in(&self, key: &GroupKey) -> Vec<UserId> {
        let mut seen = HashSet::new();
        self.members(key)
            .iter()
            .filter_map(|connection_id| {
                self.outlets
                    .get(connection_id)
                    .map(|attached| attached.user_id.clone())
            })
            .filter(|user_id| seen.insert(user_id.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, key: &GroupKey) -> bool {
        self.memberships
            .get(connection_id)
            .is_some_and(|keys| keys.contains(key))
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.outlets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ConnectionRegistry;
    use std::time::Duration;

    fn router() -> (RoomBroadcastRouter, ConnectionRegistry) {
        let registry = ConnectionRegistry::default();
        (RoomBroadcastRouter::new(Arc::new(registry.clone())), registry)
    }

    fn connect(
        router: &RoomBroadcastRouter,
        registry: &ConnectionRegistry,
        connection: &str,
        user: &str,
    ) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(ConnectionId::from(connection), UserId::from(user));
        router.attach(ConnectionId::from(connection), UserId::from(user), tx);
        rx
    }

    fn room(id: &str) -> GroupKey {
        GroupKey::Room(RoomId::from(id))
    }

    fn hello() -> ServerMessage {
        ServerMessage::error("hello")
    }

    async fn no_message(rx: &mut mpsc::Receiver<ServerMessage>) -> bool {
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err()
    }

    #[test]
    fn test_group_key_namespaces() {
        assert_eq!(room("7").to_string(), "room:7");
        assert_eq!(GroupKey::Call(CallId::from("7")).to_string(), "call:7");
        assert_eq!(GroupKey::User(UserId::from("7")).to_string(), "user:7");
        assert_ne!(room("7"), GroupKey::Call(CallId::from("7")));
    }

    #[tokio::test]
    async fn test_join_and_broadcast() {
        let (router, registry) = router();
        let mut rx1 = connect(&router, &registry, "conn1", "user1");
        let mut rx2 = connect(&router, &registry, "conn2", "user2");

        router.join(&ConnectionId::from("conn1"), room("7"));
        router.join(&ConnectionId::from("conn2"), room("7"));

        assert_eq!(router.broadcast(&room("7"), &hello(), None), 2);
        assert_eq!(rx1.recv().await.unwrap(), hello());
        assert_eq!(rx2.recv().await.unwrap(), hello());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_connection() {
        let (router, registry) = router();
        let mut rx1 = connect(&router, &registry, "conn1", "user1");
        let mut rx2 = connect(&router, &registry, "conn2", "user2");
        router.join(&ConnectionId::from("conn1"), room("7"));
        router.join(&ConnectionId::from("conn2"), room("7"));

        let sent = router.broadcast(&room("7"), &hello(), Some(&ConnectionId::from("conn1")));

        assert_eq!(sent, 1);
        assert!(rx2.recv().await.is_some());
        assert!(no_message(&mut rx1).await);
    }

    #[tokio::test]
    async fn test_closed_connection_is_skipped_not_removed() {
        let (router, registry) = router();
        let rx1 = connect(&router, &registry, "conn1", "user1");
        let mut rx2 = connect(&router, &registry, "conn2", "user2");
        router.join(&ConnectionId::from("conn1"), room("7"));
        router.join(&ConnectionId::from("conn2"), room("7"));
        drop(rx1);

        assert_eq!(router.broadcast(&room("7"), &hello(), None), 1);
        assert!(rx2.recv().await.is_some());
        assert_eq!(router.members(&room("7")).len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_many_delivers_once() {
        let (router, registry) = router();
        let mut rx1 = connect(&router, &registry, "conn1", "user1");
        let call = GroupKey::Call(CallId::from("call1"));
        router.join(&ConnectionId::from("conn1"), room("7"));
        router.join(&ConnectionId::from("conn1"), call.clone());

        assert_eq!(router.broadcast_many(&[room("7"), call], &hello(), None), 1);
        assert!(rx1.recv().await.is_some());
        assert!(no_message(&mut rx1).await);
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_connection() {
        let (router, registry) = router();
        let mut tab1 = connect(&router, &registry, "conn1", "user1");
        let mut tab2 = connect(&router, &registry, "conn2", "user1");
        let mut other = connect(&router, &registry, "conn3", "user2");

        assert_eq!(router.send_to_user(&UserId::from("user1"), &hello()), 2);
        assert!(tab1.recv().await.is_some());
        assert!(tab2.recv().await.is_some());
        assert!(no_message(&mut other).await);
    }

    #[tokio::test]
    async fn test_send_to_closed_connection_fails() {
        let (router, registry) = router();
        let rx = connect(&router, &registry, "conn1", "user1");
        drop(rx);

        assert!(matches!(
            router.send_to_connection(&ConnectionId::from("conn1"), &hello()),
            Err(Error::Closed(_))
        ));
        assert!(matches!(
            router.send_to_connection(&ConnectionId::from("ghost"), &hello()),
            Err(Error::NotAttached(_))
        ));
    }

    #[tokio::test]
    async fn test_full_outlet_drops_message() {
        let (router, _registry) = router();
        let (tx, _rx) = mpsc::channel(1);
        router.attach(ConnectionId::from("conn1"), UserId::from("user1"), tx);

        assert!(router
            .send_to_connection(&ConnectionId::from("conn1"), &hello())
            .is_ok());
        assert!(matches!(
            router.send_to_connection(&ConnectionId::from("conn1"), &hello()),
            Err(Error::Backpressure(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_leaves_every_group() {
        let (router, registry) = router();
        let _rx = connect(&router, &registry, "conn1", "user1");
        let conn = ConnectionId::from("conn1");
        router.join(&conn, room("7"));
        router.join(&conn, room("8"));
        assert_eq!(router.group_count(), 3);

        router.detach(&conn);

        assert_eq!(router.group_count(), 0);
        assert_eq!(router.connection_count(), 0);
        assert!(router.members(&room("7")).is_empty());
    }

    #[tokio::test]
    async fn test_evict_closes_outlet_but_keeps_groups() {
        let (router, registry) = router();
        let mut rx = connect(&router, &registry, "conn1", "user1");
        let conn = ConnectionId::from("conn1");
        router.join(&conn, room("7"));

        assert!(router.evict(&conn));
        assert!(!router.evict(&conn));

        assert_eq!(router.members(&room("7")), vec![conn.clone()]);
        assert_eq!(router.broadcast(&room("7"), &hello(), None), 0);
        assert_eq!(rx.recv().await, None);

        router.detach(&conn);
        assert!(router.members(&room("7")).is_empty());
    }

    #[tokio::test]
    async fn test_leave_and_rejoin() {
        let (router, registry) = router();
        let _rx = connect(&router, &registry, "conn1", "user1");
        let conn = ConnectionId::from("conn1");

        assert!(router.join(&conn, room("7")));
        assert!(!router.join(&conn, room("7")));
        router.leave(&conn, &room("7"));
        assert!(!router.is_member(&conn, &room("7")));
        assert!(router.join(&conn, room("7")));
        assert_eq!(router.members(&room("7")), vec![conn]);
    }

    #[tokio::test]
    async fn test_dissolve_and_users_in() {
        let (router, registry) = router();
        let _a = connect(&router, &registry, "conn1", "user1");
        let _b = connect(&router, &registry, "conn2", "user1");
        let _c = connect(&router, &registry, "conn3", "user2");
        let call = GroupKey::Call(CallId::from("call1"));
        for conn in ["conn1", "conn2", "conn3"] {
            router.join(&ConnectionId::from(conn), call.clone());
        }

        assert_eq!(
            router.users_in(&call),
            vec![UserId::from("user1"), UserId::from("user2")]
        );

        router.dissolve(&call);
        assert!(router.members(&call).is_empty());
        assert!(!router.is_member(&ConnectionId::from("conn1"), &call));
    }
}
