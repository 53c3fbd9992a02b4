use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Caller is not a member of the room or not a participant of the call
    #[error("Not authorized: {0}")]
    AuthorizationDenied(String),

    /// A call is already active, or screen sharing is already taken
    #[error("Conflict: {0}")]
    SessionConflict(String),

    /// No such call, or the target peer is not in the roster
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target connection closed between lookup and send
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short label used for metrics and structured logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Authentication(_) => "authentication",
            Self::AuthorizationDenied(_) => "authorization_denied",
            Self::SessionConflict(_) => "session_conflict",
            Self::NotFound(_) => "not_found",
            Self::TransportUnavailable(_) => "transport_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::Internal(_) => "internal",
        }
    }

    /// Message safe to hand back to the originating connection
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal(_) => {
                tracing::error!("Internal error: {self}");
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = Error::Internal("pool exhausted at 10.0.0.3".to_string());
        assert_eq!(err.client_message(), "Internal error");
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_client_message_keeps_taxonomy_text() {
        let err = Error::SessionConflict("A call is already active in this room".to_string());
        assert_eq!(
            err.client_message(),
            "Conflict: A call is already active in this room"
        );
        assert_eq!(err.kind(), "session_conflict");
    }
}
