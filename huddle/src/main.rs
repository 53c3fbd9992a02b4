mod server;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use huddle_cluster::sync::ConnectionLimits;
use huddle_cluster::{ConnectionRegistry, RoomBroadcastRouter};
use huddle_core::config::RoomBackend;
use huddle_core::service::{
    IdentityVerifier, JwtVerifier, PgRoomDirectory, RoomDirectory, StaticRoomDirectory,
};
use huddle_core::{logging, Config};

use server::HuddleServer;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle presence and call signaling server", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, env = "HUDDLE_CONFIG")]
    config: Option<String>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

async fn room_directory(config: &Config) -> Result<Arc<dyn RoomDirectory>> {
    let directory: Arc<dyn RoomDirectory> = match config.rooms.backend {
        RoomBackend::Static => {
            info!(
                rooms = config.rooms.members.len(),
                "Using static room membership"
            );
            Arc::new(StaticRoomDirectory::from_config(&config.rooms))
        }
        RoomBackend::Postgres => Arc::new(PgRoomDirectory::connect(&config.rooms).await?),
    };
    Ok(directory)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(&args)?;

    // 2. Validate (fail fast, report every problem)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Collaborators
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(
        config.auth.jwt_secret.as_bytes(),
        config.auth.issuer.clone(),
    ));
    let directory = room_directory(&config).await?;

    // 5. Connection state
    let registry = ConnectionRegistry::new(ConnectionLimits::from(&config.connection_limits));
    let router = RoomBroadcastRouter::new(Arc::new(registry.clone()));
    info!(
        max_per_user = config.connection_limits.max_per_user,
        max_total = config.connection_limits.max_total,
        "Connection registry initialized"
    );

    HuddleServer::new(config, registry, router, verifier, directory)
        .start()
        .await
}
