//! trellis-node — the Trellis full-node binary.
//!
//! Startup sequence:
//!   1. Parse CLI and load the JSON config (config errors exit 1, before
//!      the store is touched)
//!   2. Open (or destroy/rebuild/revert) the state database (exit 2 on
//!      storage failure)
//!   3. Apply or verify genesis
//!   4. Start gossip, packet workers, the PBFT engine and timers
//!   5. Run until ctrl-c; consistency failures exit 3

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use trellis_core::error::TrellisError;
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vrf::VrfKeyPair;

mod config;
mod node;

use config::{expand_tilde, NodeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "trellis-node",
    version,
    about = "Trellis full node — block-DAG dissemination under PBFT finality"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full node.
    Node {
        /// Path to the JSON node config.
        #[arg(long)]
        config: PathBuf,

        /// Directory for the persistent database.
        #[arg(long, default_value = "~/.trellis/data")]
        data_dir: PathBuf,

        /// Override the configured chain id.
        #[arg(long)]
        network_id: Option<u64>,

        /// Additional boot-node multiaddresses.
        #[arg(long)]
        boot_node: Vec<String>,

        /// Wipe the database before starting.
        #[arg(long)]
        destroy_db: bool,

        /// Replay persisted periods through a fresh database, then start.
        #[arg(long)]
        rebuild_db: bool,

        /// Truncate the final chain to this period before starting.
        #[arg(long)]
        revert_to_period: Option<u64>,
    },

    /// Generate a fresh account keypair and print it as JSON.
    Account,

    /// Derive the account address from a 32-byte hex secret key.
    AccountFromKey { secret: String },

    /// Generate a fresh VRF seed and print seed + public key as JSON.
    Vrf,

    /// Derive the VRF public key from a 32-byte hex seed.
    VrfFromKey { seed: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trellis=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Exit codes: 0 success, 1 config, 2 storage, 3 integrity.
fn exit_code_for(e: &TrellisError) -> u8 {
    match e {
        TrellisError::Config(_) => 1,
        TrellisError::Storage(_) => 2,
        TrellisError::OrderMismatch { .. } | TrellisError::PeriodOutOfOrder { .. } => 3,
        _ => 1,
    }
}

fn dispatch(cli: Cli) -> Result<(), TrellisError> {
    match cli.command {
        Command::Node {
            config,
            data_dir,
            network_id,
            boot_node,
            destroy_db,
            rebuild_db,
            revert_to_period,
        } => {
            let mut node_config = NodeConfig::load(&config)?;
            if let Some(id) = network_id {
                node_config.genesis.chain_id = id;
            }
            node_config.boot_nodes.extend(boot_node);

            let data_dir = expand_tilde(&data_dir);
            if destroy_db && data_dir.exists() {
                info!(dir = %data_dir.display(), "destroying database");
                std::fs::remove_dir_all(&data_dir)
                    .map_err(|e| TrellisError::Storage(e.to_string()))?;
            }
            std::fs::create_dir_all(&data_dir)
                .map_err(|e| TrellisError::Storage(e.to_string()))?;
            if rebuild_db {
                info!("rebuilding database from period data");
                node::rebuild_db(&data_dir, &node_config)?;
            }

            let runtime = tokio::runtime::Runtime::new()
                .map_err(|e| TrellisError::Config(format!("starting runtime: {e}")))?;
            runtime.block_on(node::run(node_config, data_dir, revert_to_period))
        }

        Command::Account => {
            let kp = KeyPair::generate();
            println!(
                "{}",
                serde_json::json!({
                    "address": format!("{:#x}", kp.address),
                    "secret": hex::encode(*kp.secret_bytes()),
                })
            );
            Ok(())
        }

        Command::AccountFromKey { secret } => {
            let bytes = NodeConfig::parse_secret(&secret)?;
            let kp = KeyPair::from_secret_bytes(&bytes)
                .map_err(|_| TrellisError::Config("invalid secret key".into()))?;
            println!(
                "{}",
                serde_json::json!({ "address": format!("{:#x}", kp.address) })
            );
            Ok(())
        }

        Command::Vrf => {
            let mut seed = [0u8; 32];
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut seed);
            let vrf = VrfKeyPair::from_seed(&seed);
            println!(
                "{}",
                serde_json::json!({
                    "seed": hex::encode(seed),
                    "public_key": hex::encode(vrf.public_key().0),
                })
            );
            Ok(())
        }

        Command::VrfFromKey { seed } => {
            let bytes = NodeConfig::parse_secret(&seed)?;
            let vrf = VrfKeyPair::from_seed(&bytes);
            println!(
                "{}",
                serde_json::json!({ "public_key": hex::encode(vrf.public_key().0) })
            );
            Ok(())
        }
    }
}
