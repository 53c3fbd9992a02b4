//! Test helpers and fixtures for huddle tests
//!
//! Enabled for this crate's unit tests and, through the `test-helpers`
//! feature, for integration tests of downstream crates.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{AuthConfig, Config};
use crate::models::{ConnectionId, RoomId, UserId};
use crate::service::call::Caller;

/// Shared HMAC secret for tokens minted in tests
pub const TEST_JWT_SECRET: &str = "huddle-test-secret-0123456789abcdef";

/// Create a test user ID
#[must_use]
pub fn test_user_id(id: &str) -> UserId {
    UserId::from_string(id.to_string())
}

/// Create a test room ID
#[must_use]
pub fn test_room_id(id: &str) -> RoomId {
    RoomId::from_string(id.to_string())
}

/// Create a test connection ID
#[must_use]
pub fn test_connection_id(id: &str) -> ConnectionId {
    ConnectionId::from_string(id.to_string())
}

/// Configuration that passes validation
#[must_use]
pub fn test_config() -> Config {
    Config {
        auth: AuthConfig {
            jwt_secret: TEST_JWT_SECRET.to_string(),
            issuer: None,
        },
        ..Config::default()
    }
}

/// Test fixture builder for `Caller`
pub struct CallerFixture {
    user_id: UserId,
    connection_id: ConnectionId,
    rooms: HashSet<RoomId>,
}

impl CallerFixture {
    #[must_use]
    pub fn new(user: &str) -> Self {
        Self {
            user_id: test_user_id(user),
            connection_id: ConnectionId::new(),
            rooms: HashSet::new(),
        }
    }

    #[must_use]
    pub fn on_connection(mut self, connection: &str) -> Self {
        self.connection_id = test_connection_id(connection);
        self
    }

    #[must_use]
    pub fn in_room(mut self, room: &str) -> Self {
        self.rooms.insert(test_room_id(room));
        self
    }

    #[must_use]
    pub fn build(self) -> Caller {
        Caller::new(self.user_id, self.connection_id, Arc::new(self.rooms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_fixture() {
        let caller = CallerFixture::new("u1").on_connection("c1").in_room("7").build();
        assert_eq!(caller.user_id, test_user_id("u1"));
        assert_eq!(caller.connection_id, test_connection_id("c1"));
        assert!(caller.is_member(&test_room_id("7")));
        assert!(!caller.is_member(&test_room_id("8")));
    }

    #[test]
    fn test_config_is_valid() {
        assert!(test_config().validate().is_ok());
    }
}
