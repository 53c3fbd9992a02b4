pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{ConnectionRegistry, GroupKey, RoomBroadcastRouter};
