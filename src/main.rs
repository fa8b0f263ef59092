//! Quadpong Server
//!
//! Binds the WebSocket server and runs until Ctrl-C.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quadpong::network::{GameServer, ServerConfig};
use quadpong::{MATCH_DURATION_TICKS, TICK_RATE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(feature = "debug-tracing") {
            EnvFilter::new("quadpong=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env().context("reading configuration")?;

    info!("Quadpong Server v{}", VERSION);
    info!("Tick Rate: {} Hz", config.tick_rate);
    info!("Match Duration: {} ticks ({} seconds)", MATCH_DURATION_TICKS, MATCH_DURATION_TICKS / TICK_RATE);
    if !config.auth.is_configured() {
        info!("Identity tokens not configured, trusting client-supplied ids");
    }

    let server = std::sync::Arc::new(GameServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_server.shutdown(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await.context("running game server")?;
    info!("Server stopped");
    Ok(())
}
