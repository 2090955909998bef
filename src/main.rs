//! hidden-gateway
//!
//! Serves a local API and static assets over HTTP(S) and, optionally, relays
//! a hidden service published on an anonymity overlay to the same listener.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request      ┌──────────────────────────────────────────────────┐
//!     ────────────────────┼─▶ net::listener ─▶ http::server ─▶ filter chain  │
//!                         │   (TLS, idle,      (hyper auto)    rewrite       │
//!                         │    reuse-addr)                     rate limit    │
//!                         │                                    routing ─▶ API handler
//!                         │                                    gzip          │
//!                         │                                        ▲         │
//!     Overlay client      │                                        │         │
//!     ────────────────────┼─▶ overlay (tor) ─▶ relay::hidden ──────┘         │
//!                         │                    (upload/download pumps)       │
//!                         │                                                  │
//!                         │  lifecycle::coordinator owns startup & shutdown  │
//!                         └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hidden_gateway::config::{load_config, GatewayConfig};
use hidden_gateway::handler::StatusHandler;
use hidden_gateway::lifecycle::signals::shutdown_signal;
use hidden_gateway::lifecycle::LifecycleCoordinator;
use hidden_gateway::observability::{logging, metrics};
use hidden_gateway::overlay;

#[derive(Parser)]
#[command(name = "hidden-gateway")]
#[command(about = "HTTP gateway with an optional hidden-service relay", long_about = None)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration, print it and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    if cli.check {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hidden-gateway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        tls = config.listener.tls_enabled,
        relay = config.relay.enabled,
        "Configuration loaded"
    );

    let network = overlay::network_for(&config.relay);
    let coordinator = LifecycleCoordinator::new(config, Arc::new(StatusHandler::default()), network);

    let started = tokio::select! {
        result = coordinator.start() => result,
        _ = shutdown_signal() => {
            coordinator.shutdown().await;
            return Ok(());
        }
    };
    if let Err(e) = started {
        tracing::error!(error = %e, "Startup failed");
        coordinator.shutdown().await;
        return Err(e.into());
    }

    shutdown_signal().await;
    coordinator.shutdown().await;
    Ok(())
}
