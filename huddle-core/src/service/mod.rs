pub mod auth;
pub mod call;
pub mod membership;
pub mod presence;

pub use auth::{Claims, IdentityVerifier, JwtVerifier};
pub use call::{
    Audience, CallEffect, CallSession, CallSessionManager, Caller, Delivery, ParticipantState,
    SignalingRelay,
};
pub use membership::{PgRoomDirectory, RoomDirectory, StaticRoomDirectory};
pub use presence::PresenceView;
