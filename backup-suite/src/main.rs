//! Backup Suite - Main entry point
//!
//! Hosts the backup engine behind an HTTP/WebSocket API.

use anyhow::Result;
use backup_suite::{api, config::Config, daemon::shutdown::ShutdownCoordinator, utils, Collaborators, Engine};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    utils::logger::init(&config.log, args.log_level.as_deref())?;

    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!("Starting backup-suite v{}", env!("CARGO_PKG_VERSION"));

    // Determine address
    let port = args.port.unwrap_or(config.api.port);
    let addr: SocketAddr = format!("{}:{}", config.api.bind, port).parse()?;

    let collaborators = Collaborators::host(&config);
    let engine = Engine::new(config, collaborators);
    let shutdown_coordinator = ShutdownCoordinator::default();

    let app = api::create_router(api::AppState::new(engine.clone()));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut stop = shutdown_coordinator.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        stop.recv().await.ok();
    });
    let server_handle = tokio::spawn(async move { server.await });

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    // Cancel running backups and let them clean up
    shutdown_coordinator.shutdown(&engine).await;

    // Wait for server to finish (with timeout)
    match tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
