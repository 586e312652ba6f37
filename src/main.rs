mod config;
mod downlink;
mod error;
mod metering;
mod network_server;
mod reconciler;
mod session;
#[cfg(test)]
mod test_support;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use downlink::{Dispatcher, DownlinkCommand};
use metering::MeteringClient;
use network_server::NetworkServerClient;
use reconciler::Reconciler;
use session::SessionManager;

#[derive(Parser)]
#[command(name = "meter-repoll")]
#[command(about = "Re-polls LoRaWAN meters that are missing a daily reading")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run a single reconciliation cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env: {}", e);
        }
    }

    // Load configuration
    let mut config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });
    config.apply_env();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("meter-repoll v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let payload = config.downlink.payload_bytes()?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http.timeout_secs))
        .build()?;

    info!(
        "Metering backend: {} ({} meter(s))",
        config.metering.base_url,
        config.metering.meters.len()
    );
    info!("Network server: {}", config.network_server.base_url);
    info!("MQTT broker: {}:{}", config.mqtt.host, config.mqtt.port);

    let reconciler = Reconciler::start(
        SessionManager::new(
            http.clone(),
            config.metering.clone(),
            config.network_server.clone(),
        ),
        MeteringClient::new(http.clone(), config.metering.clone(), config.report.clone()),
        NetworkServerClient::new(http, config.network_server.clone()),
        Dispatcher::new(
            config.mqtt.clone(),
            DownlinkCommand::new(config.downlink.f_port, &payload),
            config.schedule.dispatch_timeout(),
        ),
        &config.report,
        config.schedule.clone(),
    )
    .await;

    let mut reconciler = match reconciler {
        Ok(r) => r,
        Err(e) => {
            error!("Initial authentication failed: {}", e);
            return Err(e.into());
        }
    };

    if cli.once {
        let summary = reconciler.run_once().await?;
        info!(
            "Single cycle done: {} missing, {} re-polled",
            summary.missing,
            summary.dispatched()
        );
        return Ok(());
    }

    info!("Reconciliation loop running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = reconciler.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Shutting down...");
        }
    }

    Ok(())
}
