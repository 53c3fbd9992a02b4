use crate::models::{ConnectionId, UserId};

/// Read-only projection of the connection registry
///
/// Call coordination resolves participants to live connections through this
/// view and never touches the registry's maps directly.
#[cfg_attr(test, mockall::automock)]
pub trait PresenceView: Send + Sync {
    /// Live connections owned by `user_id`, oldest first
    fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId>;

    /// Whether `user_id` has at least one live connection
    fn is_online(&self, user_id: &UserId) -> bool;
}
