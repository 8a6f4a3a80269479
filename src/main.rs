use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use protected_log::audit::ProtectedLog;
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::{CaKeyRing, TokenReference};
use protected_log::database::SqliteLogStore;

#[derive(Parser)]
#[command(name = "protected-log")]
#[command(about = "Protected log daemon: signs, verifies and exports the tamper-evident log")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "protected_log=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting protected log daemon");

    let config = ProtectedLogConfig::load(args.config.as_deref())?;
    info!("Configuration loaded for node {}", config.node_id);

    let store = Arc::new(SqliteLogStore::connect(&config.database_url).await?);
    info!("Database connected");

    let key_ring = Arc::new(CaKeyRing::from_config(&config.ca_keys)?);
    if let TokenReference::CaName(ca_name) = config.token_reference()? {
        match key_ring.certificate(&ca_name)? {
            Some(certificate) => info!(
                "Signing with CA {} (serial {})",
                ca_name, certificate.serial_number
            ),
            None => warn!("CA {} is not in the key ring, signing will fail", ca_name),
        }
    }
    let device = Arc::new(ProtectedLog::new(config.clone(), store, key_ring)?);

    // Scheduled signing of open chain tails
    if config.signing_interval_secs > 0 && !device.token().is_none() {
        let device = device.clone();
        let period = Duration::from_secs(config.signing_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = device.sign_pending().await {
                    error!("Failed to sign pending chains: {}", e);
                }
            }
        });
        info!("Chain signer started");
    }

    // Periodic verification
    if config.verification_interval_secs > 0 {
        let device = device.clone();
        let period = Duration::from_secs(config.verification_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match device.run_verification_if_not_busy().await {
                    Ok(Some(report)) if !report.is_success() => {
                        warn!("Verification reported {}", report.summary())
                    }
                    Ok(_) => {}
                    Err(e) => error!("Verification pass failed: {}", e),
                }
            }
        });
        info!("Verifier started");
    }

    // Periodic export
    if config.export_path.is_some() && config.export_interval_secs > 0 {
        let device = device.clone();
        let period = Duration::from_secs(config.export_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match device.run_export_if_not_busy().await {
                    Ok(Some(receipt)) => {
                        info!("Exported {} entries to {:?}", receipt.entry_count, receipt.path)
                    }
                    Ok(None) => {}
                    Err(e) if e.is_operational() => warn!("Export will be retried: {}", e),
                    Err(e) => error!("Export failed: {}", e),
                }
            }
        });
        info!("Exporter started");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    device.shutdown().await?;
    Ok(())
}
