use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use trellis_core::constants::DEFAULT_POOL_CAPACITY;
use trellis_core::error::TrellisError;
use trellis_genesis::GenesisConfig;

/// Top-level node configuration, loaded from JSON before the store opens.
/// Config errors abort startup with exit code 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub genesis: GenesisConfig,
    /// Node signing key, 32-byte hex. Generated ephemerally when absent
    /// (fine for development, useless for a real validator).
    #[serde(default)]
    pub node_secret: Option<String>,
    /// VRF seed, 32-byte hex.
    #[serde(default)]
    pub vrf_seed: Option<String>,
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default)]
    pub boot_nodes: Vec<String>,
    #[serde(default = "default_workers")]
    pub packet_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub packet_queue_capacity: usize,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Seconds of tip silence before the VDF drops to stale difficulty.
    #[serde(default = "default_stale_after")]
    pub dag_stale_after_secs: u64,
    /// Milliseconds between DAG block proposal attempts.
    #[serde(default = "default_proposal_interval")]
    pub dag_proposal_interval_ms: u64,
}

fn default_listen() -> String {
    "/ip4/0.0.0.0/tcp/10002".into()
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    4_096
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_stale_after() -> u64 {
    60
}
fn default_proposal_interval() -> u64 {
    2_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, TrellisError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| TrellisError::Config(format!("reading {}: {e}", path.display())))?;
        let config: NodeConfig =
            serde_json::from_str(&json).map_err(|e| TrellisError::Config(e.to_string()))?;
        config.genesis.validate()?;
        Ok(config)
    }

    pub fn parse_secret(hex_str: &str) -> Result<[u8; 32], TrellisError> {
        let bytes = hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| TrellisError::Config(format!("secret key hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(TrellisError::Config("secret key must be 32 bytes".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
