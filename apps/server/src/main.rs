//! Zonecast Server - headless PA zone controller.
//!
//! Runs the playback arbiter, zone synchronization engine and schedule
//! trigger behind the realtime, live-audio and broker-bridge WebSockets.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tokio::signal;
use zonecast_core::zones::serial_link;
use zonecast_core::{
    bind, bootstrap_services, serve, AppState, FfmpegLauncher, NoopSerialTransport,
    SerialTransport,
};

use crate::config::ServerConfig;

/// Zonecast Server - PA zone controller and encoder supervisor.
#[derive(Parser, Debug)]
#[command(name = "zonecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "ZONECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ZONECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ZONECAST_BIND_PORT")]
    port: Option<u16>,

    /// `host:port` of the serial-over-TCP bridge (overrides config file).
    #[arg(short = 's', long, env = "ZONECAST_SERIAL_ADDR")]
    serial_addr: Option<String>,

    /// Data directory for persisted zone state.
    #[arg(short = 'd', long, env = "ZONECAST_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Zonecast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(addr) = args.serial_addr {
        config.serial_addr = Some(addr);
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    log::info!(
        "Configuration: bind_port={}, serial={}, zones={}",
        config.bind_port,
        config.serial_addr.as_deref().unwrap_or("none"),
        config.engine.zone_count
    );

    // Connect the serial link before the engines so the first writes land
    let (serial, reader) = match &config.serial_addr {
        Some(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("Failed to connect to serial bridge at {}", addr))?;
            let (writer, reader) = serial_link::split(stream);
            log::info!("Serial link connected to {}", addr);
            (Arc::new(writer) as Arc<dyn SerialTransport>, Some(reader))
        }
        None => {
            log::warn!("No serial bridge configured - zone commands will not reach hardware");
            (Arc::new(NoopSerialTransport) as Arc<dyn SerialTransport>, None)
        }
    };

    let core_config = config.to_core_config();
    let launcher = Arc::new(FfmpegLauncher::new(core_config.encoder.clone()));
    let services = bootstrap_services(core_config, serial, launcher)
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    if let Some(reader) = reader {
        services.attach_serial_reader(reader);
    }
    services.start_background_tasks();

    log::info!("Background tasks started");

    let listener = bind(config.bind_port)
        .await
        .with_context(|| format!("Failed to bind port {}", config.bind_port))?;
    let app_state = AppState::new(&services);
    let server_cancel = services.cancel_token.child_token();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, app_state, server_cancel).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown (cancels the server token too)
    services.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        log::warn!("HTTP server did not drain within 5s");
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
