use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_core::config::ConnectionLimitsConfig;
use huddle_core::models::{ConnectionId, UserId};
use huddle_core::service::PresenceView;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(connection_id: ConnectionId, user_id: UserId) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            user_id,
            created_at: Utc::now(),
            connected_at: now,
            last_activity: now,
            message_count: 0,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Connection limits configuration
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum connections per user
    pub max_per_user: usize,

    /// Maximum total connections
    pub max_total: usize,

    /// Idle timeout (disconnect if no activity)
    pub idle_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_user: 5,
            max_total: 10000,
            idle_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl From<&ConnectionLimitsConfig> for ConnectionLimits {
    fn from(config: &ConnectionLimitsConfig) -> Self {
        Self {
            max_per_user: config.max_per_user,
            max_total: config.max_total,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// A user's reachability changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub online: bool,
}

/// Tracks live connections per verified user; the source of presence truth
#[derive(Clone)]
pub struct ConnectionRegistry {
    /// All live connections by `connection_id`
    connections: Arc<DashMap<ConnectionId, ConnectionInfo>>,

    /// Connections by `user_id`, oldest first
    user_connections: Arc<DashMap<UserId, Vec<ConnectionId>>>,

    limits: Arc<ConnectionLimits>,

    presence_tx: broadcast::Sender<PresenceEvent>,

    /// Metrics
    total_connections: Arc<AtomicU64>,
    total_messages: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(limits: ConnectionLimits) -> Self {
        let (presence_tx, _) = broadcast::channel(256);
        Self {
            connections: Arc::new(DashMap::new()),
            user_connections: Arc::new(DashMap::new()),
            limits: Arc::new(limits),
            presence_tx,
            total_connections: Arc::new(AtomicU64::new(0)),
            total_messages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admission check, run before a transport is accepted
    pub fn check_capacity(&self, user_id: &UserId) -> Result<()> {
        if self.connections.len() >= self.limits.max_total {
            return Err(Error::ServerAtCapacity(self.limits.max_total));
        }
        if self.user_connection_count(user_id) >= self.limits.max_per_user {
            return Err(Error::UserAtCapacity(self.limits.max_per_user));
        }
        Ok(())
    }

    /// Register a connection for `user_id`
    ///
    /// Idempotent per connection id. Returns `true` when this made the user
    /// come online.
    pub fn register(&self, connection_id: ConnectionId, user_id: UserId) -> bool {
        if let Some(existing) = self.connections.get(&connection_id) {
            if existing.user_id != user_id {
                warn!(
                    connection_id = %connection_id,
                    registered_user = %existing.user_id,
                    user_id = %user_id,
                    "Connection already registered to another user, ignoring"
                );
            }
            return false;
        }

        self.connections.insert(
            connection_id.clone(),
            ConnectionInfo::new(connection_id.clone(), user_id.clone()),
        );

        let came_online = {
            let mut conns = self.user_connections.entry(user_id.clone()).or_default();
            let was_empty = conns.is_empty();
            conns.push(connection_id.clone());
            was_empty
        };

        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            total_connections = self.connections.len(),
            "Connection registered"
        );

        if came_online {
            self.publish(PresenceEvent {
                user_id,
                online: true,
            });
        }
        came_online
    }

    /// Unregister a connection
    ///
    /// Unknown ids are ignored. Returns the offline event when this was the
    /// user's last connection.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<PresenceEvent> {
        let (_, conn_info) = self.connections.remove(connection_id)?;

        if let Some(mut user_conns) = self.user_connections.get_mut(&conn_info.user_id) {
            user_conns.retain(|id| id != connection_id);
        }
        let went_offline = self
            .user_connections
            .remove_if(&conn_info.user_id, |_, conns| conns.is_empty())
            .is_some();

        info!(
            connection_id = %connection_id,
            user_id = %conn_info.user_id,
            duration = ?conn_info.duration(),
            message_count = conn_info.message_count,
            "Connection unregistered"
        );

        if !went_offline {
            return None;
        }

        let event = PresenceEvent {
            user_id: conn_info.user_id,
            online: false,
        };
        self.publish(event.clone());
        Some(event)
    }

    /// Presence changes as they happen
    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }

    fn publish(&self, event: PresenceEvent) {
        debug!(user_id = %event.user_id, online = event.online, "Presence changed");
        // No subscribers is fine
        let _ = self.presence_tx.send(event);
    }

    /// Record message activity for a connection
    pub fn record_activity(&self, connection_id: &ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_activity = Instant::now();
            conn.message_count += 1;
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections idle for longer than the configured timeout
    #[must_use]
    pub fn idle_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.idle_duration() > self.limits.idle_timeout)
            .map(|entry| {
                warn!(
                    connection_id = %entry.connection_id,
                    idle_duration = ?entry.idle_duration(),
                    "Connection idle timeout"
                );
                entry.connection_id.clone()
            })
            .collect()
    }

    #[must_use]
    pub fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.user_connections
            .get(user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.user_connections
            .get(user_id)
            .is_some_and(|conns| !conns.is_empty())
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Owner of a connection
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|conn| conn.user_id.clone())
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.user_connections
            .get(user_id)
            .map_or(0, |conns| conns.len())
    }

    #[must_use]
    pub fn online_user_count(&self) -> usize {
        self.user_connections.len()
    }

    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.connection_count(),
            online_users: self.online_user_count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}

impl PresenceView for ConnectionRegistry {
    fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        Self::connections_of(self, user_id)
    }

    fn is_online(&self, user_id: &UserId) -> bool {
        Self::is_online(self, user_id)
    }
}

/// Connection metrics
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub online_users: usize,
    pub total_connections: u64,
    pub total_messages: u64,
}
