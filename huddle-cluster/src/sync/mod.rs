// Module: sync

pub mod registry;
pub mod router;

pub use registry::{
    ConnectionInfo, ConnectionLimits, ConnectionMetrics, ConnectionRegistry, PresenceEvent,
};
pub use router::{GroupKey, Outlet, RoomBroadcastRouter};
