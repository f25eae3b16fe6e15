//! trellis-genesis
//!
//! Builds a chain's founding state: funded accounts, the validator stake
//! table, the DAG genesis block, and the period-0 state snapshot — written
//! straight into the store with no signatures, VDF proofs, or votes. This is
//! the only place account balances come into existence outside of rewards.
//!
//! Everything downstream treats the outputs as startup-computed constants:
//! the genesis hash that guards handshakes, the stake table vote validation
//! reads, and the engine/pool/VDF parameter blocks all derive from
//! [`GenesisConfig`] before any worker starts.

pub mod params;

pub use params::{BalanceAlloc, GenesisConfig, ValidatorAlloc, VdfGenesis};

use rlp::RlpStream;
use tracing::info;

use trellis_core::account::Account;
use trellis_core::encoding::keccak256;
use trellis_core::error::TrellisError;
use trellis_core::types::{BlockHash, H256};
use trellis_dag::block::DagBlock;
use trellis_state::db::{StateDb, StateSnapshot, WriteBatch};
use trellis_state::exec::StateOverlay;
use trellis_state::final_chain::rolling_state_root;

/// What genesis application hands to the node wiring.
#[derive(Clone, Debug)]
pub struct GenesisState {
    /// Chain-unique hash guarding status handshakes.
    pub genesis_hash: H256,
    pub dag_genesis: DagBlock,
    pub state_root: H256,
}

/// The chain-unique commitment to a genesis config: chain id, timestamp,
/// and every allocation, in order.
pub fn chain_hash(config: &GenesisConfig) -> H256 {
    let mut s = RlpStream::new();
    s.begin_unbounded_list();
    s.append(&config.chain_id);
    s.append(&config.timestamp);
    s.append(&config.gas_limit);
    for alloc in &config.initial_balances {
        s.begin_list(2);
        s.append(&alloc.address);
        s.append(&alloc.balance);
    }
    for validator in &config.validators {
        s.begin_list(3);
        s.append(&validator.address);
        s.append(&validator.stake);
        s.append(&validator.vrf_key.as_bytes().to_vec());
    }
    s.finalize_unbounded_list();
    keccak256(&s.out())
}

/// Apply genesis to a fresh store, or verify and load it from a previously
/// initialized one.
pub fn ensure_genesis(db: &StateDb, config: &GenesisConfig) -> Result<GenesisState, TrellisError> {
    config.validate()?;
    let genesis_hash = chain_hash(config);
    let dag_genesis = DagBlock::genesis();

    if let Some(snapshot) = db.latest_snapshot()? {
        // Existing database: the stored period-0 snapshot must belong to
        // this genesis config.
        let period0 = db
            .snapshot(0)?
            .ok_or_else(|| TrellisError::Config("database has no genesis snapshot".into()))?;
        if period0.block_hash != genesis_hash {
            return Err(TrellisError::Config(
                "database belongs to a different genesis".into(),
            ));
        }
        info!(period = snapshot.period, "existing database, genesis verified");
        return Ok(GenesisState {
            genesis_hash,
            dag_genesis,
            state_root: period0.state_root,
        });
    }

    let mut overlay = StateOverlay::new(db);
    for alloc in &config.initial_balances {
        overlay.set_account(alloc.address, Account::with_balance(alloc.balance));
    }
    let state_root = rolling_state_root(&H256::zero(), &overlay);

    let mut batch = WriteBatch::default();
    for (addr, account) in overlay.changes() {
        db.stage_account(&mut batch, addr, account);
    }
    db.stage_dag_block(&mut batch, &dag_genesis);
    // Period 0 snapshot carries the chain hash in the block-hash slot: there
    // is no PBFT block before period 1.
    db.stage_snapshot(
        &mut batch,
        &StateSnapshot {
            period: 0,
            block_hash: BlockHash::from(genesis_hash),
            state_root,
        },
    );
    db.commit(batch)?;
    info!(
        %genesis_hash,
        accounts = config.initial_balances.len(),
        validators = config.validators.len(),
        "genesis applied"
    );
    Ok(GenesisState {
        genesis_hash,
        dag_genesis,
        state_root,
    })
}
