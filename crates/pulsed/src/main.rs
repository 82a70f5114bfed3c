//! # pulsed - cluster heartbeat daemon
//!
//! Keeps every node informed of which peers are alive and what they last
//! reported, over interchangeable heartbeat transports.
//!
//! ## Architecture
//! ```text
//! LocalStatus → Crypt → sender ──(unicast TCP | relay slot)──→ receiver → Crypt → ClusterStore
//!                                                                              ↓
//!                                                                    GET /status
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cluster;
mod config;
mod heartbeat;
mod relay;
mod routes;
mod state;

use config::AppConfig;
use state::AppState;

/// Pulse - cluster heartbeat and liveness daemon
#[derive(Parser, Debug)]
#[command(name = "pulsed")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/pulsed.toml")]
    config: String,

    /// Node name (overrides config)
    #[arg(short, long, env = "PULSE_NODENAME")]
    nodename: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting pulsed v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!(
        nodename = %config.nodename,
        cluster = %config.cluster.name,
        "Configuration loaded from {}",
        args.config
    );

    let state = AppState::new(config.clone())?;

    let running = state.heartbeats.start(&config).await;
    info!(
        running,
        configured = config.heartbeats.len(),
        "Heartbeats started"
    );
    if state.relay_slots.is_some() {
        info!("Relay service enabled");
    }

    #[cfg(unix)]
    spawn_signal_handlers(state.clone(), args.config.clone(), args.nodename.clone(), args.listen.clone());

    // Build router
    let app = routes::create_router(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("pulsed listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    state.heartbeats.stop().await;

    info!("pulsed shutdown complete");
    Ok(())
}

/// SIGHUP reloads the configuration file, SIGUSR1 forces a heartbeat burst
#[cfg(unix)]
fn spawn_signal_handlers(
    state: AppState,
    config_path: String,
    nodename: Option<String>,
    listen: Option<String>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let reload_state = state.clone();
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };

        let overrides = Args {
            config: config_path.clone(),
            nodename,
            listen,
            log_level: String::new(),
            json_logs: false,
        };

        while hup.recv().await.is_some() {
            info!("SIGHUP received, reloading {}", config_path);
            match AppConfig::load(&config_path, &overrides) {
                Ok(config) => {
                    reload_state.reload(config).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Reload failed, keeping the running configuration");
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGUSR1 handler");
                return;
            }
        };

        while usr1.recv().await.is_some() {
            state.heartbeats.kick();
        }
    });
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
