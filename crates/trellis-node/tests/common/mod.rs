//! Shared wiring for the end-to-end suites: a single-validator chain built
//! from real components on a scratch database.
#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use trellis_consensus::config::{CommitteeConfig, StaticStakeView};
use trellis_consensus::engine::{ChainHead, FinalizedPeriod, PbftEngine};
use trellis_consensus::pbft_block::PbftBlock;
use trellis_consensus::sortition::sortition_weight;
use trellis_consensus::vote::Vote;
use trellis_consensus::vote_manager::VoteManager;
use trellis_core::constants::CERT_STEP;
use trellis_core::transaction::Transaction;
use trellis_core::types::{Address, BlockHash, TxHash, H256, U256};
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vdf::solve;
use trellis_crypto::vrf::{verify_vrf, VrfKeyPair};
use trellis_dag::block::DagBlock;
use trellis_dag::manager::DagManager;
use trellis_genesis::{ensure_genesis, BalanceAlloc, GenesisConfig, ValidatorAlloc, VdfGenesis};
use trellis_pool::{PoolConfig, TransactionPool};
use trellis_state::db::{PeriodData, StateDb};
use trellis_state::exec::TransferVm;
use trellis_state::final_chain::{FinalChain, VoteWeigher};

pub const CHAIN_ID: u64 = 77;
pub const VDF_DIFFICULTY: u16 = 1;

pub struct TestChain {
    pub _dir: tempfile::TempDir,
    pub db: Arc<StateDb>,
    pub genesis: GenesisConfig,
    pub genesis_hash: H256,
    pub validator: Arc<KeyPair>,
    pub vrf: Arc<VrfKeyPair>,
    pub dag: Arc<DagManager>,
    pub votes: Arc<VoteManager>,
    pub pool: Arc<TransactionPool>,
    pub final_chain: Arc<FinalChain>,
}

/// Genesis with one validator (stake 3, τ = 3 so its full stake always wins
/// sortition and alone meets 2f+1 = 3) plus the given funded accounts.
pub fn single_validator_genesis(
    validator: &KeyPair,
    vrf: &VrfKeyPair,
    funded: &[(Address, u64)],
) -> GenesisConfig {
    GenesisConfig {
        chain_id: CHAIN_ID,
        timestamp: 1_700_000_000,
        lambda_ms: 50,
        gas_limit: 10_000_000,
        soft_committee: 3,
        cert_committee: 3,
        delegation_delay: 0,
        vdf: VdfGenesis {
            difficulty_min: VDF_DIFFICULTY,
            difficulty_max: VDF_DIFFICULTY,
            difficulty_stale: VDF_DIFFICULTY,
        },
        max_ghost_size: 100,
        ghost_path_move_back: 1,
        block_reward: 1_000,
        initial_balances: funded
            .iter()
            .map(|(address, balance)| BalanceAlloc {
                address: *address,
                balance: U256::from(*balance),
            })
            .collect(),
        validators: vec![ValidatorAlloc {
            address: validator.address,
            stake: 3,
            vrf_key: hex::encode(vrf.public_key().0),
        }],
    }
}

/// The weight re-derivation the node wires into the final chain.
pub fn weigher_for(genesis: &GenesisConfig) -> VoteWeigher {
    let table = Arc::new(genesis.stake_table().unwrap());
    let committee: CommitteeConfig = genesis.committee();
    Arc::new(move |vote: &Vote, period_hash: &H256| -> u64 {
        let Ok(voter) = vote.voter() else { return 0 };
        let Some(entry) = table.get(&voter) else { return 0 };
        let msg = vote.sortition.message(period_hash);
        let Ok(output) = verify_vrf(&entry.vrf_key, &vote.sortition.proof, &msg) else {
            return 0;
        };
        sortition_weight(
            &output,
            entry.stake,
            table.total_stake(),
            committee.expected_weight(vote.sortition.step),
        )
    })
}

pub fn build_chain(genesis: GenesisConfig, validator: KeyPair, vrf: VrfKeyPair) -> TestChain {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(StateDb::open(dir.path()).unwrap());
    let state = ensure_genesis(&db, &genesis).unwrap();
    let committee = genesis.committee();
    let final_chain = Arc::new(
        FinalChain::new(
            Arc::clone(&db),
            Arc::new(TransferVm),
            genesis.rewards(),
            genesis.gas_limit,
            committee.two_t_plus_one(CERT_STEP),
            weigher_for(&genesis),
        )
        .unwrap(),
    );
    let votes = Arc::new(VoteManager::new(
        committee,
        Arc::new(StaticStakeView::new(genesis.stake_table().unwrap())),
    ));
    let dag = Arc::new(DagManager::new(state.dag_genesis.clone()));
    let pool = Arc::new(TransactionPool::new(PoolConfig {
        capacity: 1_024,
        chain_id: genesis.chain_id,
        block_gas_limit: genesis.gas_limit,
    }));
    TestChain {
        _dir: dir,
        db,
        genesis_hash: state.genesis_hash,
        genesis,
        validator: Arc::new(validator),
        vrf: Arc::new(vrf),
        dag,
        votes,
        pool,
        final_chain,
    }
}

pub fn signed_transfer(
    kp: &KeyPair,
    nonce: u64,
    to: Address,
    value: u64,
    gas_price: u64,
) -> Transaction {
    let mut tx = Transaction::new_unsigned(
        nonce,
        U256::from(gas_price),
        21_000,
        Some(to),
        U256::from(value),
        vec![],
        CHAIN_ID,
    );
    kp.sign_transaction(&mut tx);
    tx
}

/// Author and insert one DAG block packaging `txs` on top of the current
/// pivot tip.
pub fn author_dag_block(chain: &TestChain, txs: &[TxHash], timestamp: u64) -> BlockHash {
    let pivot = *chain.dag.pivot_chain().last().unwrap();
    let level = chain.dag.get(&pivot).unwrap().level + 1;
    let period_hash = chain.final_chain.head().pbft_block_hash;
    let challenge = DagBlock::vdf_challenge(level, &period_hash);
    let vdf = solve(&challenge, VDF_DIFFICULTY, &AtomicBool::new(false)).unwrap();
    let (vrf_proof, _) = chain.vrf.prove(&challenge);
    let mut block = DagBlock::new(pivot, vec![], level, timestamp, vdf, vrf_proof, txs.to_vec());
    block.sign(&chain.validator);
    chain
        .dag
        .insert(block, &period_hash, VDF_DIFFICULTY, timestamp)
        .unwrap()
}

/// Drive one period to finality the way the network would: anchor the pivot
/// tip, sign the PBFT block, cert-vote it, execute, commit.
pub fn finalize_next_period(chain: &TestChain) -> PeriodData {
    let head = chain.final_chain.head();
    let period = head.period + 1;
    let anchor = *chain.dag.pivot_chain().last().unwrap();
    let set = chain.dag.period_set(&anchor).unwrap();
    let dag_hashes: Vec<BlockHash> = set.iter().map(|b| b.hash()).collect();
    let mut seen = std::collections::HashSet::new();
    let mut tx_hashes = Vec::new();
    for block in &set {
        for tx in &block.transactions {
            if seen.insert(*tx) {
                tx_hashes.push(*tx);
            }
        }
    }
    let order_hash = PbftBlock::compute_order_hash(&dag_hashes, &tx_hashes);
    let mut block = PbftBlock::new(
        period,
        head.pbft_block_hash,
        anchor,
        order_hash,
        chain.validator.address,
        chain.genesis.timestamp + period,
    );
    block.sign(&chain.validator);

    let cert_vote = Vote::signed(
        block.hash(),
        period,
        1,
        CERT_STEP,
        &head.pbft_block_hash,
        &chain.vrf,
        &chain.validator,
    );
    let finalized = FinalizedPeriod {
        period,
        block,
        cert_votes: vec![Arc::new(cert_vote)],
    };

    let pool = Arc::clone(&chain.pool);
    let db = Arc::clone(&chain.db);
    let provider = move |h: &TxHash| {
        pool.get(h)
            .map(|tx| tx.as_ref().clone())
            .or_else(|| db.transaction(h).ok().flatten())
    };
    chain
        .final_chain
        .finalize_period(&finalized, &set, &provider)
        .unwrap();
    chain.dag.assign_period(period, &dag_hashes);
    for hash in &tx_hashes {
        chain.pool.remove(hash);
    }
    chain.db.period_data(period).unwrap().unwrap()
}

/// A PBFT engine wired to this chain's components, starting at the current
/// head.
pub fn engine_for(chain: &TestChain) -> PbftEngine {
    let head = chain.final_chain.head();
    PbftEngine::new(
        chain.genesis.pbft_config(),
        Arc::clone(&chain.validator),
        Arc::clone(&chain.vrf),
        Arc::clone(&chain.votes),
        Arc::clone(&chain.dag),
        ChainHead {
            period: head.period + 1,
            prev_block_hash: head.pbft_block_hash,
            prev_anchor: chain.dag.genesis_hash(),
        },
    )
}
