//! Server lifecycle
//!
//! Starts the coordinator and the HTTP/WebSocket listener, then waits for
//! a shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use huddle_api::http::{create_router, AppState};
use huddle_api::Coordinator;
use huddle_cluster::{ConnectionRegistry, RoomBroadcastRouter};
use huddle_core::service::{IdentityVerifier, RoomDirectory};
use huddle_core::Config;

pub struct HuddleServer {
    config: Config,
    registry: ConnectionRegistry,
    router: RoomBroadcastRouter,
    verifier: Arc<dyn IdentityVerifier>,
    directory: Arc<dyn RoomDirectory>,
}

impl HuddleServer {
    pub fn new(
        config: Config,
        registry: ConnectionRegistry,
        router: RoomBroadcastRouter,
        verifier: Arc<dyn IdentityVerifier>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            verifier,
            directory,
        }
    }

    /// Run until SIGTERM or Ctrl+C
    pub async fn start(self) -> anyhow::Result<()> {
        let Self {
            config,
            registry,
            router,
            verifier,
            directory,
        } = self;

        let coordinator = Coordinator::new(registry.clone(), router, config.call.max_participants);
        let (handle, coordinator_task) =
            coordinator.spawn(config.connection_limits.sweep_interval());

        let state = AppState::new(handle, registry, verifier, directory, &config.server);
        let app = create_router(state);

        let http_address = config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let http_task = tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        });

        shutdown_signal().await;
        info!("Shutdown signal received, starting graceful shutdown...");
        let _ = shutdown_tx.send(true);

        if let Err(e) = http_task.await {
            error!("HTTP server task failed: {}", e);
        }
        // Upgraded sockets outlive graceful shutdown and still hold handles
        coordinator_task.abort();

        info!("Huddle server shut down complete");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
