use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use waddle_pubsub::{ChannelBroadcaster, PubSubService, ServiceConfig, ServicePorts};

mod delivery;
mod telemetry;

use telemetry::LogFormat;

/// Standalone Waddle publish-subscribe service.
#[derive(Debug, Parser)]
#[command(name = "waddle-pubsub-server", version, about)]
struct Args {
    /// TOML configuration file. Defaults plus `WADDLE_PUBSUB_*` environment
    /// overrides are used when omitted.
    #[arg(short, long, env = "WADDLE_PUBSUB_CONFIG")]
    config: Option<PathBuf>,

    /// Console log format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let telemetry = telemetry::init(args.log_format)?;

    info!("Waddle PubSub starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("License: AGPL-3.0");

    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ServiceConfig::from_env().context("Failed to read configuration")?,
    };
    config.log_config();

    let (broadcaster, deliveries) = ChannelBroadcaster::new();
    let cancel = CancellationToken::new();
    let sink = tokio::spawn(delivery::run(deliveries, cancel.clone()));

    let service = PubSubService::new(config, ServicePorts::in_memory(Arc::new(broadcaster)))
        .await
        .context("Failed to initialize pubsub service")?;
    service.start().await;
    info!(nodes = service.node_count(), "PubSub service ready");

    shutdown_signal().await;
    info!("Shutdown signal received");

    service.shutdown().await;
    cancel.cancel();
    if let Err(e) = sink.await {
        warn!(error = %e, "Delivery sink task failed");
    }
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
