//! Period finalizer and final-chain state.
//!
//! Everything in this pipeline is deterministic: the canonical order hash is
//! recomputed and asserted against the finalized PBFT block before anything
//! executes, transactions run strictly in order, and the state root is a
//! pure function of (previous root, ordered account changes). Period p+1
//! cannot start until period p's batch is committed — the head advances
//! under one lock at the end of `finalize_period`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rlp::RlpStream;
use tracing::{error, info};

use trellis_consensus::engine::FinalizedPeriod;
use trellis_consensus::pbft_block::PbftBlock;
use trellis_consensus::rewards::{distribute_rewards, RewardsConfig, RewardsInput};
use trellis_consensus::vote::Vote;
use trellis_core::account::Account;
use trellis_core::encoding::{keccak256, ordered_trie_root};
use trellis_core::error::TrellisError;
use trellis_core::header::BlockHeader;
use trellis_core::receipt::Receipt;
use trellis_core::transaction::Transaction;
use trellis_core::types::{Address, BlockHash, Bloom, Period, TxHash, H256, U256};
use trellis_crypto::ecdsa::recover_transaction_sender;
use trellis_dag::block::DagBlock;

use crate::db::{PeriodData, StateDb, StateSnapshot, WriteBatch};
use crate::exec::{transaction_fee, BlockContext, Execution, StateOverlay};

/// Re-derives a vote's sortition weight against the period-binding hash its
/// VRF credential was taken over (the reward bundle is weight-proportional).
/// Wired to the stake table by the node; tests may weigh every vote as 1.
pub type VoteWeigher = Arc<dyn Fn(&Vote, &H256) -> u64 + Send + Sync>;

/// The committed chain head.
#[derive(Clone, Copy, Debug)]
pub struct HeadState {
    pub period: Period,
    pub pbft_block_hash: BlockHash,
    pub header_hash: H256,
    pub state_root: H256,
}

pub struct FinalChain {
    db: Arc<StateDb>,
    exec: Arc<dyn Execution>,
    rewards: RewardsConfig,
    gas_limit: u64,
    /// 2f+1 weight the cert step requires; sync verification gates on it.
    cert_threshold: u64,
    vote_weigher: VoteWeigher,
    head: Mutex<HeadState>,
}

impl FinalChain {
    /// Load the head from the latest persisted snapshot (a fresh DB starts
    /// at period 0 with empty roots — genesis writes the first snapshot).
    pub fn new(
        db: Arc<StateDb>,
        exec: Arc<dyn Execution>,
        rewards: RewardsConfig,
        gas_limit: u64,
        cert_threshold: u64,
        vote_weigher: VoteWeigher,
    ) -> Result<Self, TrellisError> {
        let head = match db.latest_snapshot()? {
            Some(snapshot) => {
                let header_hash = db
                    .period_data(snapshot.period)?
                    .map(|d| d.header.hash())
                    .unwrap_or_else(H256::zero);
                HeadState {
                    period: snapshot.period,
                    pbft_block_hash: snapshot.block_hash,
                    header_hash,
                    state_root: snapshot.state_root,
                }
            }
            None => HeadState {
                period: 0,
                pbft_block_hash: BlockHash::zero(),
                header_hash: H256::zero(),
                state_root: H256::zero(),
            },
        };
        info!(period = head.period, "final chain loaded");
        Ok(Self {
            db,
            exec,
            rewards,
            gas_limit,
            cert_threshold,
            vote_weigher,
            head: Mutex::new(head),
        })
    }

    pub fn head(&self) -> HeadState {
        *self.head.lock().expect("final chain head lock")
    }

    pub fn db(&self) -> &Arc<StateDb> {
        &self.db
    }

    pub fn account(&self, addr: &Address) -> Account {
        self.db.account(addr).ok().flatten().unwrap_or_default()
    }

    /// Locally re-derived total weight behind a cert-vote set, paired with
    /// the 2f+1 threshold it must meet. `period_hash` is the binding hash
    /// the votes' VRF credentials were taken over (the finalized block's
    /// `prev_block_hash`). Invalid votes weigh zero.
    pub fn cert_quorum_weight(&self, votes: &[Vote], period_hash: &H256) -> (u64, u64) {
        let total = votes.iter().map(|v| (self.vote_weigher)(v, period_hash)).sum();
        (total, self.cert_threshold)
    }

    /// Execute one finalized period and commit it.
    ///
    /// `dag_blocks` is the period set in canonical order; `tx_provider`
    /// resolves the transactions they reference (pool or store).
    pub fn finalize_period(
        &self,
        finalized: &FinalizedPeriod,
        dag_blocks: &[Arc<DagBlock>],
        tx_provider: &dyn Fn(&TxHash) -> Option<Transaction>,
    ) -> Result<BlockHeader, TrellisError> {
        let block = &finalized.block;
        let head = self.head();
        if block.period != head.period + 1 {
            return Err(TrellisError::PeriodOutOfOrder {
                expected: head.period + 1,
                got: block.period,
            });
        }

        // 1–2. Recompute and assert the order commitment. A mismatch after
        // 2f+1 cert votes is a consistency failure the orchestrator halts
        // on, not something to shrug off.
        let dag_hashes: Vec<BlockHash> = dag_blocks.iter().map(|b| b.hash()).collect();
        let (tx_hashes, first_includer) = first_inclusion_order(dag_blocks);
        let computed = PbftBlock::compute_order_hash(&dag_hashes, &tx_hashes);
        if computed != block.order_hash {
            error!(
                period = block.period,
                expected = %block.order_hash,
                %computed,
                "order hash mismatch on finalized block"
            );
            return Err(TrellisError::OrderMismatch {
                period: block.period,
                expected: block.order_hash,
                computed,
            });
        }

        // 3. Resolve bodies and senders.
        let mut transactions = Vec::with_capacity(tx_hashes.len());
        for hash in &tx_hashes {
            let tx = tx_provider(hash).ok_or_else(|| {
                TrellisError::Execution(format!("missing transaction {hash} for period"))
            })?;
            let sender = recover_transaction_sender(&tx)?;
            transactions.push((tx, sender));
        }

        // 4. Execute in canonical order.
        let ctx = BlockContext {
            author: block.beneficiary,
            timestamp: block.timestamp,
            gas_limit: self.gas_limit,
            number: block.period,
        };
        let mut overlay = StateOverlay::new(&self.db);
        let mut receipts: Vec<Receipt> = Vec::with_capacity(transactions.len());
        let mut cumulative_gas = 0u64;
        let mut log_bloom = Bloom::zero();
        let mut tx_fees: Vec<(Address, U256)> = Vec::new();
        for (tx, sender) in &transactions {
            let mut receipt = self.exec.transact(&mut overlay, &ctx, tx, *sender);
            cumulative_gas += receipt.gas_used;
            receipt.cumulative_gas_used = cumulative_gas;
            log_bloom.accrue_bloom(&receipt.bloom());
            let fee = transaction_fee(tx, &receipt);
            if !fee.is_zero() {
                if let Some(author) = first_includer.get(&tx.hash()) {
                    tx_fees.push((*author, fee));
                }
            }
            receipts.push(receipt);
        }

        // 5. Rewards: voters of the previous period's block, this block's
        // proposer, and DAG authors that contributed new transactions.
        let prev_period = block.period.saturating_sub(1);
        let reward_votes = self.db.cert_votes(prev_period)?;
        let reward_binding = self
            .db
            .pbft_block(prev_period)?
            .map(|b| b.prev_block_hash)
            .unwrap_or_else(H256::zero);
        let cert_voters: Vec<(Address, u64)> = reward_votes
            .iter()
            .filter_map(|vote| {
                let voter = vote.voter().ok()?;
                let weight = (self.vote_weigher)(vote, &reward_binding);
                (weight > 0).then_some((voter, weight))
            })
            .collect();
        let eligible_dag_authors = eligible_authors(dag_blocks, &first_includer);
        let rewards_input = RewardsInput {
            period: block.period,
            proposer: block.beneficiary,
            cert_voters,
            eligible_dag_authors,
            tx_fees,
        };
        let credits = distribute_rewards(&self.rewards, &rewards_input);
        let total_reward = credits.values().fold(U256::zero(), |acc, v| acc + *v);
        for (addr, amount) in &credits {
            overlay.credit(*addr, *amount);
        }

        // 6. Header, roots, state root.
        let tx_bodies: Vec<Transaction> = transactions.iter().map(|(tx, _)| tx.clone()).collect();
        let state_root = rolling_state_root(&head.state_root, &overlay);
        let mut header = BlockHeader {
            parent_hash: head.header_hash,
            state_root,
            transactions_root: ordered_trie_root(&tx_bodies),
            receipts_root: ordered_trie_root(&receipts),
            log_bloom,
            number: block.period,
            gas_limit: self.gas_limit,
            gas_used: cumulative_gas,
            extra_data: vec![],
            timestamp: block.timestamp,
            author: block.beneficiary,
            total_reward,
            size: 0,
        };
        header.seal_size();

        // 7. Single atomic batch: period bundle, indexes, accounts, snapshot.
        let cert_votes: Vec<Vote> = finalized
            .cert_votes
            .iter()
            .map(|v| v.as_ref().clone())
            .collect();
        let mut batch = WriteBatch::default();
        let data = PeriodData {
            pbft_block: block.clone(),
            cert_votes: cert_votes.clone(),
            dag_blocks: dag_blocks.iter().map(|b| b.as_ref().clone()).collect(),
            transactions: tx_bodies,
            header: header.clone(),
            receipts,
            bonus_votes_count: 0,
        };
        self.db.stage_period_data(&mut batch, &data);
        self.db.stage_pbft_block(&mut batch, block);
        self.db.stage_cert_votes(&mut batch, block.period, &cert_votes);
        for dag_block in dag_blocks {
            self.db.stage_dag_block(&mut batch, dag_block);
        }
        for (tx, _) in &transactions {
            self.db.stage_transaction(&mut batch, tx);
        }
        for (addr, account) in overlay.changes() {
            self.db.stage_account(&mut batch, addr, account);
        }
        self.db.stage_snapshot(
            &mut batch,
            &StateSnapshot {
                period: block.period,
                block_hash: block.hash(),
                state_root,
            },
        );
        self.db.commit(batch)?;

        let mut head = self.head.lock().expect("final chain head lock");
        *head = HeadState {
            period: block.period,
            pbft_block_hash: block.hash(),
            header_hash: header.hash(),
            state_root,
        };
        info!(
            period = block.period,
            state_root = %state_root,
            gas_used = cumulative_gas,
            "period committed"
        );
        Ok(header)
    }

    /// Truncate the chain back to `period` (operator `--revert-to-period`).
    pub fn revert_to(&self, period: Period) -> Result<(), TrellisError> {
        self.db.delete_period_data_above(period)?;
        let snapshot = self.db.snapshot(period)?;
        let mut head = self.head.lock().expect("final chain head lock");
        *head = match snapshot {
            Some(s) => HeadState {
                period: s.period,
                pbft_block_hash: s.block_hash,
                header_hash: self
                    .db
                    .period_data(s.period)?
                    .map(|d| d.header.hash())
                    .unwrap_or_else(H256::zero),
                state_root: s.state_root,
            },
            None => HeadState {
                period: 0,
                pbft_block_hash: BlockHash::zero(),
                header_hash: H256::zero(),
                state_root: H256::zero(),
            },
        };
        Ok(())
    }
}

/// Transactions in concatenated DAG order, first inclusion winning, plus the
/// author that first included each one.
fn first_inclusion_order(
    dag_blocks: &[Arc<DagBlock>],
) -> (Vec<TxHash>, HashMap<TxHash, Address>) {
    let mut seen: HashSet<TxHash> = HashSet::new();
    let mut order = Vec::new();
    let mut first_includer = HashMap::new();
    for block in dag_blocks {
        let author = block.author().ok();
        for tx in &block.transactions {
            if seen.insert(*tx) {
                order.push(*tx);
                if let Some(author) = author {
                    first_includer.insert(*tx, author);
                }
            }
        }
    }
    (order, first_includer)
}

/// Authors of blocks that contributed at least one unique transaction.
/// Deduplicated, address-ordered.
fn eligible_authors(
    dag_blocks: &[Arc<DagBlock>],
    first_includer: &HashMap<TxHash, Address>,
) -> Vec<Address> {
    let mut authors: Vec<Address> = dag_blocks
        .iter()
        .filter_map(|block| {
            let author = block.author().ok()?;
            let contributed = block
                .transactions
                .iter()
                .any(|tx| first_includer.get(tx) == Some(&author));
            contributed.then_some(author)
        })
        .collect();
    authors.sort();
    authors.dedup();
    authors
}

/// Rolling state commitment: Keccak over (previous root, address-ordered
/// account changes). A pure function of its inputs. Genesis uses it too,
/// seeding from the zero root.
pub fn rolling_state_root(prev: &H256, overlay: &StateOverlay<'_>) -> H256 {
    let mut s = RlpStream::new();
    s.begin_unbounded_list();
    s.append(prev);
    for (addr, account) in overlay.changes() {
        s.begin_list(2);
        s.append(addr);
        s.append(account);
    }
    s.finalize_unbounded_list();
    keccak256(&s.out())
}
