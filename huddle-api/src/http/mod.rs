//! HTTP API module
//!
//! Exposes the signaling WebSocket plus liveness and metrics endpoints.

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use huddle_cluster::ConnectionRegistry;
use huddle_core::config::ServerConfig;
use huddle_core::service::{IdentityVerifier, RoomDirectory};

use crate::impls::CoordinatorHandle;

pub use error::{AppError, AppResult};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    /// Read-only here: admission checks before upgrade
    pub registry: ConnectionRegistry,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub directory: Arc<dyn RoomDirectory>,
    pub max_message_size: usize,
    pub outbound_buffer: usize,
}

impl AppState {
    pub fn new(
        coordinator: CoordinatorHandle,
        registry: ConnectionRegistry,
        verifier: Arc<dyn IdentityVerifier>,
        directory: Arc<dyn RoomDirectory>,
        server: &ServerConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            verifier,
            directory,
            max_message_size: server.max_message_size,
            outbound_buffer: server.outbound_buffer,
        }
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
