//! Huddle call client
//!
//! Signaling connection with reconnect, local capture tracks and the
//! per-call [`PeerConnectionManager`] that runs full-mesh WebRTC
//! negotiation against every other participant.

pub mod config;
pub mod error;
pub mod event;
mod link;
pub mod manager;
pub mod media;
pub mod retry;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use config::{ClientConfig, IceServerConfig};
pub use error::{ClientError, Result};
pub use event::CallEvent;
pub use manager::PeerConnectionManager;
pub use media::{LocalStream, LocalTrack, MediaSource};
pub use retry::RetryPolicy;
pub use rtc::WebRtcTransportFactory;
pub use signaling::{SignalingClient, SignalingEvent, SignalingSink};
pub use transport::{PeerState, PeerTransport, PeerTransportFactory, TransportEvent};
