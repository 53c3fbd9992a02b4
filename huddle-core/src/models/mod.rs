//! Domain identifiers, shared with the wire protocol.

pub use huddle_proto::id::{generate_id, CallId, ConnectionId, RoomId, UserId};
pub use huddle_proto::{CallType, MediaKind, ParticipantInfo};
