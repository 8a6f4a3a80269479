//! Protected Log Recovery CLI
//!
//! Operator commands run after a confirmed incident. Every destructive
//! command asks for a random confirmation code first.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use protected_log::audit::{ProtectedLog, ResetOutcome};
use protected_log::config::ProtectedLogConfig;
use protected_log::crypto::CaKeyRing;
use protected_log::database::SqliteLogStore;

#[derive(Parser)]
#[command(name = "reset-protected-log")]
#[command(about = "Protected log recovery operations")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove every chain and start over from a signed reset entry
    Reset {
        /// Reason recorded in the reset entry
        #[arg(short, long)]
        reason: String,

        /// Reset even if the pre-reset export fails
        #[arg(long)]
        force: bool,
    },

    /// Remove the chain of a decommissioned node
    RemoveNode {
        /// Node whose chain is removed
        node_id: String,
    },

    /// Sign every unsigned chain tail
    Resign {
        /// Also replace signatures that no longer verify
        #[arg(long)]
        force_resign: bool,
    },
}

fn confirm(action: &str) -> Result<()> {
    let code: u32 = rand::thread_rng().gen_range(1000..10000);
    print!("You are about to {}. Type {} to confirm: ", action, code);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    if answer.trim() != code.to_string() {
        return Err(anyhow!("Confirmation code did not match, nothing was changed"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = ProtectedLogConfig::load(cli.config.as_deref())?;
    let store = Arc::new(SqliteLogStore::connect(&config.database_url).await?);
    let key_ring = Arc::new(CaKeyRing::from_config(&config.ca_keys)?);
    let device = ProtectedLog::new(config, store, key_ring)?;

    match cli.command {
        Commands::Reset { reason, force } => {
            confirm("remove every protected log entry")?;
            match device.reset_entire_log(force, &reason).await? {
                ResetOutcome::AlreadyReset => println!("Protected log was already reset"),
                ResetOutcome::Reset {
                    removed_entries,
                    epoch,
                    genesis,
                } => {
                    println!("Protected log reset:");
                    println!("  Removed entries: {}", removed_entries);
                    println!("  Epoch: {}", epoch);
                    println!("  Genesis: {}", genesis.current_hash);
                }
            }
        }

        Commands::RemoveNode { node_id } => {
            confirm(&format!("remove the chain of node {}", node_id))?;
            let removed = device.remove_node_chain(&node_id).await?;
            println!("Removed {} entries of node {}", removed, node_id);
        }

        Commands::Resign { force_resign } => {
            let summary = device.sign_all_unsigned_chains(force_resign).await?;
            println!("Chains signed: {}", summary.chains_signed);
            println!("Signatures replaced: {}", summary.signatures_replaced);
        }
    }

    device.shutdown().await?;
    info!("Recovery command finished");
    Ok(())
}
