//! CA Key Tool
//!
//! Generates secp256k1 CA signing keys for the protected log key ring.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

use protected_log::config::CaKeyConfig;
use protected_log::crypto::signatures::parse_secret_key;
use protected_log::crypto::{CaKeyRing, SignatureManager};

#[derive(Parser)]
#[command(name = "ca-key-tool")]
#[command(about = "Protected log CA signing key tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new CA key file
    Generate {
        /// CA name the key will be registered under
        #[arg(short, long)]
        name: String,

        /// Output file for the hex encoded secret key
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show the certificate of an existing key file
    Show {
        /// CA name
        #[arg(short, long)]
        name: String,

        /// Hex encoded secret key file
        key_file: PathBuf,
    },
}

#[derive(Serialize)]
struct KeyRingSnippet {
    ca_keys: Vec<CaKeyConfig>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate { name, output } => {
            let (secret_key, _) = SignatureManager::new().generate_keypair();

            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options
                .open(&output)
                .map_err(|e| anyhow!("Failed to create {:?}: {}", output, e))?;
            writeln!(file, "{}", hex::encode(secret_key.secret_bytes()))?;
            file.sync_all()?;

            let ring = CaKeyRing::new();
            let certificate = ring.register(&name, secret_key)?;

            println!("CA key generated successfully:");
            println!("  CA: {}", certificate.ca_name);
            println!("  Serial: {}", certificate.serial_number);
            println!("  Public Key: {}", certificate.public_key);
            println!();
            println!("Add to the protected log configuration:");
            let snippet = KeyRingSnippet {
                ca_keys: vec![CaKeyConfig {
                    name,
                    secret_key_path: output.to_string_lossy().to_string(),
                }],
            };
            print!("{}", toml::to_string(&snippet)?);
        }

        Commands::Show { name, key_file } => {
            let contents = std::fs::read_to_string(&key_file)
                .map_err(|e| anyhow!("Failed to read {:?}: {}", key_file, e))?;
            let ring = CaKeyRing::new();
            let certificate = ring.register(&name, parse_secret_key(&contents)?)?;

            println!("CA: {}", certificate.ca_name);
            println!("  Serial: {}", certificate.serial_number);
            println!("  Public Key: {}", certificate.public_key);
            println!("  Fingerprint: {}", certificate.fingerprint());
        }
    }

    Ok(())
}
