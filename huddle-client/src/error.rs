//! Client error types

use huddle_proto::{MediaKind, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Local capture failed (device denied or unavailable); the call goes on
    #[error("Media error: {0}")]
    Media(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("No local {0} track")]
    NoLocalTrack(MediaKind),

    #[error("No peer link for {0}")]
    UnknownPeer(UserId),

    #[error("Closed")]
    Closed,
}

impl ClientError {
    /// Whether the call can continue after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl From<webrtc::Error> for ClientError {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Signaling(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::Signaling(format!("Invalid signaling URL: {err}"))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Signaling(format!("Malformed frame: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(ClientError::Media("camera denied".to_string()).is_recoverable());
        assert!(ClientError::UnknownPeer(UserId::from("u2")).is_recoverable());
        assert!(!ClientError::Closed.is_recoverable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ClientError::NoLocalTrack(MediaKind::Video).to_string(),
            "No local video track"
        );
    }
}
