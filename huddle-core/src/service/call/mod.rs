//! Call coordination
//!
//! `CallSessionManager` owns the per-room session state machine and
//! `SignalingRelay` forwards negotiation envelopes between participants.

pub mod manager;
pub mod session;
pub mod signaling;

pub use manager::{Audience, CallEffect, CallSessionManager, Caller, Delivery};
pub use session::{CallSession, ParticipantState};
pub use signaling::SignalingRelay;
