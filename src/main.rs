//! gfwpass - Entry Point
//!
//! Loads configuration, resolves the subscription and supervises the local
//! proxy until Ctrl+C or SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gfwpass::config::LogConfig;
use gfwpass::shutdown::ShutdownHandle;
use gfwpass::{Config, Service};

#[derive(Parser, Debug)]
#[command(name = "gfwpass", version, about = "Keeps a working shadowsocks proxy on a local port")]
struct Args {
    /// YAML config file; environment variables are used when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Not logged: tracing is configured from this config
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    init_tracing(&config.log);

    info!("Starting gfwpass");
    info!("Configuration:\n{}", config.to_yaml());

    let service = Service::new(config)
        .await
        .inspect_err(|e| error!("Failed to start: {}", e))
        .context("failed to start")?;

    let (shutdown, shutdown_rx) = ShutdownHandle::new();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.shutdown();
    });

    service
        .run(shutdown_rx)
        .await
        .inspect_err(|e| error!("Service failed: {}", e))
        .context("service failed")?;

    info!("gfwpass stopped");
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gfwpass={}", log.level.to_ascii_lowercase())));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
