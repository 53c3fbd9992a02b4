//! HTTP surface and dispatch for the huddle signaling server
//!
//! `http` accepts and authenticates WebSocket transports; `impls` holds the
//! coordinator task that owns every registry, router and call mutation.

pub mod http;
pub mod impls;

pub use http::AppState;
pub use impls::{Command, Coordinator, CoordinatorHandle};
