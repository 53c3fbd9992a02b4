//! Room membership lookups
//!
//! Membership is owned by the external room service. The core only reads it,
//! once per connection, when the connection is accepted.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RoomsConfig;
use crate::models::{RoomId, UserId};
use crate::Result;

/// Read-only view of persisted room membership
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Every room `user_id` belongs to
    async fn rooms_of(&self, user_id: &UserId) -> Result<HashSet<RoomId>>;
}

/// Membership table held in memory, loaded from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticRoomDirectory {
    by_user: HashMap<UserId, HashSet<RoomId>>,
}

impl StaticRoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `room -> members` table
    #[must_use]
    pub fn from_config(config: &RoomsConfig) -> Self {
        let mut directory = Self::new();
        for (room, members) in &config.members {
            for member in members {
                directory.add_member(RoomId::from(room.as_str()), UserId::from(member.as_str()));
            }
        }
        info!(
            rooms = config.members.len(),
            users = directory.by_user.len(),
            "Static room directory loaded"
        );
        directory
    }

    pub fn add_member(&mut self, room_id: RoomId, user_id: UserId) {
        self.by_user.entry(user_id).or_default().insert(room_id);
    }

    #[must_use]
    pub fn with_member(mut self, room_id: impl Into<RoomId>, user_id: impl Into<UserId>) -> Self {
        self.add_member(room_id.into(), user_id.into());
        self
    }
}

#[async_trait]
impl RoomDirectory for StaticRoomDirectory {
    async fn rooms_of(&self, user_id: &UserId) -> Result<HashSet<RoomId>> {
        Ok(self.by_user.get(user_id).cloned().unwrap_or_default())
    }
}

/// Membership read from the room service's `room_members` table
#[derive(Clone)]
pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against the room service database
    pub async fn connect(config: &RoomsConfig) -> Result<Self> {
        info!("Connecting to room membership database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    async fn rooms_of(&self, user_id: &UserId) -> Result<HashSet<RoomId>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT room_id FROM room_members WHERE user_id = $1")
                .bind(user_id.as_str())
                .fetch_all(&self.pool)
                .await?;

        debug!(user_id = %user_id, rooms = rows.len(), "Loaded room memberships");
        Ok(rows.into_iter().map(RoomId::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticRoomDirectory::new()
            .with_member("7", "u1")
            .with_member("8", "u1")
            .with_member("7", "u2");

        let rooms = directory.rooms_of(&UserId::from("u1")).await.unwrap();
        assert_eq!(rooms.len(), 2);
        assert!(rooms.contains(&RoomId::from("7")));

        let none = directory.rooms_of(&UserId::from("u9")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_static_directory_from_config() {
        let mut config = RoomsConfig::default();
        config
            .members
            .insert("7".to_string(), vec!["u1".to_string(), "u2".to_string()]);

        let directory = StaticRoomDirectory::from_config(&config);
        let rooms = directory.rooms_of(&UserId::from("u2")).await.unwrap();
        assert_eq!(rooms, HashSet::from([RoomId::from("7")]));
    }
}
