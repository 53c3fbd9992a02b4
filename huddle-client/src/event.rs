use crate::transport::PeerState;
use huddle_proto::{MediaKind, UserId};

/// Surfaced to the UI layer by a `PeerConnectionManager`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    LocalStreamAvailable {
        kind: MediaKind,
        track_id: String,
    },
    /// Capture failed; the call itself continues
    MediaError {
        message: String,
    },
    RemoteTrack {
        user_id: UserId,
        track_id: String,
        kind: MediaKind,
    },
    PeerStateChanged {
        user_id: UserId,
        state: PeerState,
    },
    PeerClosed {
        user_id: UserId,
    },
    ScreenShareChanged {
        user_id: UserId,
        active: bool,
    },
    /// A `call_error` from the server
    ServerError {
        message: String,
    },
    CallEnded,
}
