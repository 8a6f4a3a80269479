use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Arg, ArgAction, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use protected_log::audit::entry::seconds;
use protected_log::audit::{open_bundle, ProtectedLog};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::CaKeyRing;
use protected_log::database::SqliteLogStore;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("verify-protected-log")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify protected log integrity or an exported evidence bundle")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Protected log configuration file"),
        )
        .arg(
            Arg::new("bundle")
                .short('b')
                .long("bundle")
                .value_name("PATH")
                .help("Verify an export bundle instead of the database"),
        )
        .arg(
            Arg::new("since")
                .short('s')
                .long("since")
                .value_name("RFC3339")
                .help("Only verify entries written at or after this time"),
        )
        .arg(
            Arg::new("freeze-threshold")
                .short('f')
                .long("freeze-threshold")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Report nodes silent for longer than this as frozen"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = ProtectedLogConfig::load(matches.get_one::<String>("config").map(Path::new))?;
    let key_ring = Arc::new(CaKeyRing::from_config(&config.ca_keys)?);

    if let Some(bundle) = matches.get_one::<String>("bundle") {
        let path = PathBuf::from(bundle);
        info!("Verifying export bundle {:?}", path);
        let slice = match open_bundle(&path, key_ring.as_ref()).await {
            Ok(slice) => slice,
            Err(e) => {
                error!("Bundle verification failed: {}", e);
                std::process::exit(1);
            }
        };
        if !quiet {
            println!(
                "✓ Bundle {} verified: {} entries in {} chains, epoch {}, root {}",
                slice.bundle_id,
                slice.entry_count(),
                slice.chains.len(),
                slice.epoch,
                slice.merkle_root
            );
        }
        if verbose {
            for entry in slice.entries() {
                println!("  {}", entry.summary());
            }
        }
        return Ok(());
    }

    let store = Arc::new(SqliteLogStore::connect(&config.database_url).await?);
    let device = ProtectedLog::new(config.clone(), store, key_ring)?;
    let threshold = matches
        .get_one::<u64>("freeze-threshold")
        .map(|secs| seconds(*secs))
        .unwrap_or_else(|| config.freeze_threshold());

    let report = match matches.get_one::<String>("since") {
        Some(since) => {
            let since = DateTime::parse_from_rfc3339(since)
                .map_err(|e| anyhow!("Invalid --since value {}: {}", since, e))?
                .with_timezone(&Utc);
            device.verify_since(since, threshold).await?
        }
        None => device.verify_entire_log(threshold).await?,
    };

    if verbose || !report.is_success() {
        for anomaly in &report.anomalies {
            println!("  {} {}", anomaly.cause, anomaly.context());
        }
    }
    if !report.is_success() {
        error!("Protected log verification failed: {}", report.summary());
        std::process::exit(1);
    }
    if !quiet {
        println!("✓ {}", report.summary());
    }
    Ok(())
}
