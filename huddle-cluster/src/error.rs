//! Error types for presence and fan-out

use huddle_proto::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server at capacity ({0} connections)")]
    ServerAtCapacity(usize),

    #[error("Too many connections for this user (max {0})")]
    UserAtCapacity(usize),

    #[error("Connection {0} is not attached")]
    NotAttached(ConnectionId),

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),

    #[error("Outbound buffer full for connection {0}")]
    Backpressure(ConnectionId),
}

impl From<Error> for huddle_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::ServerAtCapacity(_) | Error::UserAtCapacity(_) => {
                Self::SessionConflict(err.to_string())
            }
            Error::NotAttached(_) | Error::Closed(_) | Error::Backpressure(_) => {
                Self::TransportUnavailable(err.to_string())
            }
        }
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
