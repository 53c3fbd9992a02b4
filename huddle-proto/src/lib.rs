//! Huddle Protocol Definitions
//!
//! Wire types shared by the signaling server and the call client: typed
//! identifiers, negotiation payloads and the JSON frames exchanged over the
//! signaling channel.

pub mod id;
pub mod message;
pub mod signal;

pub use id::{CallId, ConnectionId, RoomId, UserId};
pub use message::{CallType, ClientMessage, MediaKind, ParticipantInfo, ServerMessage};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalPayload, SignalingEnvelope};
