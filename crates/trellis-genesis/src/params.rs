use serde::{Deserialize, Serialize};

use trellis_consensus::config::{CommitteeConfig, PbftConfig, StakeEntry, StakeTable};
use trellis_consensus::rewards::RewardsConfig;
use trellis_core::constants::{
    DEFAULT_BLOCK_GAS_LIMIT, DEFAULT_CERT_COMMITTEE, DEFAULT_DELEGATION_DELAY, DEFAULT_LAMBDA_MS,
    DEFAULT_SOFT_COMMITTEE, DEFAULT_GHOST_PATH_MOVE_BACK, DEFAULT_MAX_GHOST_SIZE,
    STEP_EXPONENT_CAP,
};
use trellis_core::error::TrellisError;
use trellis_core::types::{Address, VrfPublicKey, U256};
use trellis_crypto::vdf::VdfParams;
use trellis_dag::manager::GhostConfig;

/// One funded account at genesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceAlloc {
    pub address: Address,
    pub balance: U256,
}

/// One genesis validator: stake plus the VRF key votes are verified
/// against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorAlloc {
    pub address: Address,
    pub stake: u64,
    /// 32-byte VRF public key, hex.
    pub vrf_key: String,
}

impl ValidatorAlloc {
    pub fn parsed_vrf_key(&self) -> Result<VrfPublicKey, TrellisError> {
        let bytes = hex::decode(self.vrf_key.trim_start_matches("0x"))
            .map_err(|e| TrellisError::Config(format!("validator vrf_key: {e}")))?;
        if bytes.len() != 32 {
            return Err(TrellisError::Config(
                "validator vrf_key must be 32 bytes".into(),
            ));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(VrfPublicKey(out))
    }
}

/// The founding document of a chain. Loaded from JSON; every consensus
/// parameter a node runs with derives from here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: u64,
    pub timestamp: u64,
    #[serde(default = "default_lambda")]
    pub lambda_ms: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_soft_committee")]
    pub soft_committee: u64,
    #[serde(default = "default_cert_committee")]
    pub cert_committee: u64,
    #[serde(default = "default_delegation_delay")]
    pub delegation_delay: u64,
    #[serde(default)]
    pub vdf: VdfGenesis,
    #[serde(default = "default_max_ghost")]
    pub max_ghost_size: u64,
    #[serde(default = "default_ghost_move_back")]
    pub ghost_path_move_back: u64,
    #[serde(default = "default_block_reward")]
    pub block_reward: u64,
    pub initial_balances: Vec<BalanceAlloc>,
    pub validators: Vec<ValidatorAlloc>,
}

fn default_lambda() -> u64 {
    DEFAULT_LAMBDA_MS
}
fn default_gas_limit() -> u64 {
    DEFAULT_BLOCK_GAS_LIMIT
}
fn default_soft_committee() -> u64 {
    DEFAULT_SOFT_COMMITTEE
}
fn default_cert_committee() -> u64 {
    DEFAULT_CERT_COMMITTEE
}
fn default_delegation_delay() -> u64 {
    DEFAULT_DELEGATION_DELAY
}
fn default_max_ghost() -> u64 {
    DEFAULT_MAX_GHOST_SIZE
}
fn default_ghost_move_back() -> u64 {
    DEFAULT_GHOST_PATH_MOVE_BACK
}
fn default_block_reward() -> u64 {
    2_000_000_000
}

/// VDF difficulty bounds as they appear in the genesis file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VdfGenesis {
    pub difficulty_min: u16,
    pub difficulty_max: u16,
    pub difficulty_stale: u16,
}

impl Default for VdfGenesis {
    fn default() -> Self {
        let params = VdfParams::default();
        Self {
            difficulty_min: params.difficulty_min,
            difficulty_max: params.difficulty_max,
            difficulty_stale: params.difficulty_stale,
        }
    }
}

impl GenesisConfig {
    pub fn from_json(json: &str) -> Result<Self, TrellisError> {
        serde_json::from_str(json).map_err(|e| TrellisError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), TrellisError> {
        if self.validators.is_empty() {
            return Err(TrellisError::Config("no genesis validators".into()));
        }
        if self.vdf.difficulty_min > self.vdf.difficulty_max {
            return Err(TrellisError::Config("vdf difficulty bounds inverted".into()));
        }
        for validator in &self.validators {
            validator.parsed_vrf_key()?;
            if validator.stake == 0 {
                return Err(TrellisError::Config(format!(
                    "validator {} has zero stake",
                    validator.address
                )));
            }
        }
        Ok(())
    }

    pub fn committee(&self) -> CommitteeConfig {
        CommitteeConfig {
            soft_committee: self.soft_committee,
            cert_committee: self.cert_committee,
            delegation_delay: self.delegation_delay,
        }
    }

    pub fn pbft_config(&self) -> PbftConfig {
        PbftConfig {
            chain_id: self.chain_id,
            lambda_ms: self.lambda_ms,
            exponent_cap: STEP_EXPONENT_CAP,
            committee: self.committee(),
            ghost: self.ghost(),
        }
    }

    pub fn ghost(&self) -> GhostConfig {
        GhostConfig {
            max_ghost_size: self.max_ghost_size,
            ghost_path_move_back: self.ghost_path_move_back,
        }
    }

    pub fn vdf_params(&self) -> VdfParams {
        VdfParams {
            difficulty_min: self.vdf.difficulty_min,
            difficulty_max: self.vdf.difficulty_max,
            difficulty_stale: self.vdf.difficulty_stale,
        }
    }

    pub fn rewards(&self) -> RewardsConfig {
        RewardsConfig {
            block_reward: U256::from(self.block_reward),
            ..RewardsConfig::default()
        }
    }

    pub fn stake_table(&self) -> Result<StakeTable, TrellisError> {
        let mut entries = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            entries.push((
                validator.address,
                StakeEntry {
                    stake: validator.stake,
                    vrf_key: validator.parsed_vrf_key()?,
                },
            ));
        }
        Ok(StakeTable::new(entries))
    }
}
