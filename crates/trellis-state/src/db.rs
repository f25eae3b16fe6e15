//! Persistence layer: a generic ordered KV (sled) behind typed column
//! families.
//!
//! Named trees:
//!   dag_blocks_by_hash          — block hash      → rlp(DagBlock)
//!   dag_blocks_by_level         — level be ‖ hash → hash bytes
//!   transactions                — tx hash         → rlp(Transaction)
//!   pbft_blocks_by_period       — period be       → rlp(PbftBlock)
//!   pbft_cert_votes_by_period   — period be       → rlp([Vote])
//!   period_data                 — period be       → rlp(PeriodData)
//!   state_trie_nodes            — address bytes   → rlp(Account)
//!   final_chain_state_snapshots — period be       → rlp(period, block_hash, state_root)
//!   peer_info                   — peer id bytes   → caller-encoded bytes
//!   next_votes_bundles          — period be ‖ round be → rlp(NextVotesBundle)
//!
//! Cross-family updates are staged in a [`WriteBatch`] and committed in one
//! pass, flushed to disk at the end. A failed commit is retried once; the
//! second failure is surfaced for the orchestrator to abort on.

use std::path::Path;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use tracing::{info, warn};

use trellis_consensus::pbft_block::PbftBlock;
use trellis_consensus::vote::{NextVotesBundle, Vote};
use trellis_core::account::Account;
use trellis_core::encoding::expect_list_size;
use trellis_core::error::TrellisError;
use trellis_core::header::BlockHeader;
use trellis_core::receipt::Receipt;
use trellis_core::transaction::Transaction;
use trellis_core::types::{Address, BlockHash, Level, Period, Round, TxHash, H256};
use trellis_dag::block::DagBlock;

/// Logical column families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cf {
    DagBlocksByHash,
    DagBlocksByLevel,
    Transactions,
    PbftBlocksByPeriod,
    PbftCertVotesByPeriod,
    PeriodData,
    StateTrieNodes,
    FinalChainStateSnapshots,
    PeerInfo,
    NextVotesBundles,
}

/// Staged cross-family mutations, committed atomically per family.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<(Cf, Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn put(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((cf, key, Some(value)));
    }

    pub fn delete(&mut self, cf: Cf, key: Vec<u8>) {
        self.ops.push((cf, key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Everything one finalized period carries: the PBFT block, its cert votes,
/// the anchored DAG blocks, the executed transactions, the resulting header
/// and receipts, plus the reserved bonus-votes counter (persisted, unused).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodData {
    pub pbft_block: PbftBlock,
    pub cert_votes: Vec<Vote>,
    pub dag_blocks: Vec<DagBlock>,
    pub transactions: Vec<Transaction>,
    pub header: BlockHeader,
    pub receipts: Vec<Receipt>,
    pub bonus_votes_count: u64,
}

impl Encodable for PeriodData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.pbft_block);
        s.append_list(&self.cert_votes);
        s.append_list(&self.dag_blocks);
        s.append_list(&self.transactions);
        s.append(&self.header);
        s.append_list(&self.receipts);
        s.append(&self.bonus_votes_count);
    }
}

impl Decodable for PeriodData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 7)?;
        Ok(Self {
            pbft_block: rlp.val_at(0)?,
            cert_votes: rlp.list_at(1)?,
            dag_blocks: rlp.list_at(2)?,
            transactions: rlp.list_at(3)?,
            header: rlp.val_at(4)?,
            receipts: rlp.list_at(5)?,
            bonus_votes_count: rlp.val_at(6)?,
        })
    }
}

/// A final-chain state snapshot record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub period: Period,
    pub block_hash: BlockHash,
    pub state_root: H256,
}

impl Encodable for StateSnapshot {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.period);
        s.append(&self.block_hash);
        s.append(&self.state_root);
    }
}

impl Decodable for StateSnapshot {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 3)?;
        Ok(Self {
            period: rlp.val_at(0)?,
            block_hash: rlp.val_at(1)?,
            state_root: rlp.val_at(2)?,
        })
    }
}

pub struct StateDb {
    db: sled::Db,
    dag_blocks_by_hash: sled::Tree,
    dag_blocks_by_level: sled::Tree,
    transactions: sled::Tree,
    pbft_blocks_by_period: sled::Tree,
    pbft_cert_votes_by_period: sled::Tree,
    periods: sled::Tree,
    state_trie_nodes: sled::Tree,
    final_chain_state_snapshots: sled::Tree,
    peers: sled::Tree,
    next_votes_bundles: sled::Tree,
}

fn storage_err(e: sled::Error) -> TrellisError {
    TrellisError::Storage(e.to_string())
}

impl StateDb {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrellisError> {
        let db = sled::open(path).map_err(storage_err)?;
        let open = |name: &str| db.open_tree(name).map_err(storage_err);
        Ok(Self {
            dag_blocks_by_hash: open("dag_blocks_by_hash")?,
            dag_blocks_by_level: open("dag_blocks_by_level")?,
            transactions: open("transactions")?,
            pbft_blocks_by_period: open("pbft_blocks_by_period")?,
            pbft_cert_votes_by_period: open("pbft_cert_votes_by_period")?,
            periods: open("period_data")?,
            state_trie_nodes: open("state_trie_nodes")?,
            final_chain_state_snapshots: open("final_chain_state_snapshots")?,
            peers: open("peer_info")?,
            next_votes_bundles: open("next_votes_bundles")?,
            db,
        })
    }

    fn tree(&self, cf: Cf) -> &sled::Tree {
        match cf {
            Cf::DagBlocksByHash => &self.dag_blocks_by_hash,
            Cf::DagBlocksByLevel => &self.dag_blocks_by_level,
            Cf::Transactions => &self.transactions,
            Cf::PbftBlocksByPeriod => &self.pbft_blocks_by_period,
            Cf::PbftCertVotesByPeriod => &self.pbft_cert_votes_by_period,
            Cf::PeriodData => &self.periods,
            Cf::StateTrieNodes => &self.state_trie_nodes,
            Cf::FinalChainStateSnapshots => &self.final_chain_state_snapshots,
            Cf::PeerInfo => &self.peers,
            Cf::NextVotesBundles => &self.next_votes_bundles,
        }
    }

    /// Apply a staged batch, then flush. One retry on failure; the second
    /// error propagates (the orchestrator aborts on it).
    pub fn commit(&self, batch: WriteBatch) -> Result<(), TrellisError> {
        match self.apply(&batch) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "write batch failed, retrying once");
                self.apply(&batch)
            }
        }
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), TrellisError> {
        for (cf, key, value) in &batch.ops {
            let tree = self.tree(*cf);
            match value {
                Some(v) => tree.insert(key.as_slice(), v.as_slice()).map(|_| ()),
                None => tree.remove(key.as_slice()).map(|_| ()),
            }
            .map_err(storage_err)?;
        }
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), TrellisError> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    // ── Key helpers ──────────────────────────────────────────────────────────

    fn period_key(period: Period) -> Vec<u8> {
        period.to_be_bytes().to_vec()
    }

    fn level_key(level: Level, hash: &BlockHash) -> Vec<u8> {
        let mut key = level.to_be_bytes().to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn round_key(period: Period, round: Round) -> Vec<u8> {
        let mut key = period.to_be_bytes().to_vec();
        key.extend_from_slice(&round.to_be_bytes());
        key
    }

    // ── DAG blocks ───────────────────────────────────────────────────────────

    pub fn stage_dag_block(&self, batch: &mut WriteBatch, block: &DagBlock) {
        let hash = block.hash();
        batch.put(
            Cf::DagBlocksByHash,
            hash.as_bytes().to_vec(),
            rlp::encode(block).to_vec(),
        );
        batch.put(
            Cf::DagBlocksByLevel,
            Self::level_key(block.level, &hash),
            hash.as_bytes().to_vec(),
        );
    }

    pub fn dag_block(&self, hash: &BlockHash) -> Result<Option<DagBlock>, TrellisError> {
        self.decode_opt(self.dag_blocks_by_hash.get(hash.as_bytes()).map_err(storage_err)?)
    }

    pub fn dag_blocks_at_level(&self, level: Level) -> Result<Vec<BlockHash>, TrellisError> {
        let mut out = Vec::new();
        for item in self.dag_blocks_by_level.scan_prefix(level.to_be_bytes()) {
            let (_, v) = item.map_err(storage_err)?;
            out.push(BlockHash::from_slice(&v));
        }
        Ok(out)
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    pub fn stage_transaction(&self, batch: &mut WriteBatch, tx: &Transaction) {
        batch.put(
            Cf::Transactions,
            tx.hash().as_bytes().to_vec(),
            rlp::encode(tx).to_vec(),
        );
    }

    pub fn transaction(&self, hash: &TxHash) -> Result<Option<Transaction>, TrellisError> {
        self.decode_opt(self.transactions.get(hash.as_bytes()).map_err(storage_err)?)
    }

    // ── PBFT blocks / votes ──────────────────────────────────────────────────

    pub fn stage_pbft_block(&self, batch: &mut WriteBatch, block: &PbftBlock) {
        batch.put(
            Cf::PbftBlocksByPeriod,
            Self::period_key(block.period),
            rlp::encode(block).to_vec(),
        );
    }

    pub fn pbft_block(&self, period: Period) -> Result<Option<PbftBlock>, TrellisError> {
        self.decode_opt(
            self.pbft_blocks_by_period
                .get(Self::period_key(period))
                .map_err(storage_err)?,
        )
    }

    pub fn stage_cert_votes(&self, batch: &mut WriteBatch, period: Period, votes: &[Vote]) {
        let mut s = RlpStream::new_list(votes.len());
        for vote in votes {
            s.append(vote);
        }
        batch.put(
            Cf::PbftCertVotesByPeriod,
            Self::period_key(period),
            s.out().to_vec(),
        );
    }

    pub fn cert_votes(&self, period: Period) -> Result<Vec<Vote>, TrellisError> {
        match self
            .pbft_cert_votes_by_period
            .get(Self::period_key(period))
            .map_err(storage_err)?
        {
            Some(bytes) => {
                let rlp = Rlp::new(&bytes);
                rlp.as_list().map_err(TrellisError::from)
            }
            None => Ok(Vec::new()),
        }
    }

    // ── Period data ──────────────────────────────────────────────────────────

    pub fn stage_period_data(&self, batch: &mut WriteBatch, data: &PeriodData) {
        batch.put(
            Cf::PeriodData,
            Self::period_key(data.pbft_block.period),
            rlp::encode(data).to_vec(),
        );
    }

    pub fn period_data(&self, period: Period) -> Result<Option<PeriodData>, TrellisError> {
        self.decode_opt(self.periods.get(Self::period_key(period)).map_err(storage_err)?)
    }

    pub fn delete_period_data_above(&self, period: Period) -> Result<(), TrellisError> {
        let mut batch = WriteBatch::default();
        for item in self.final_chain_state_snapshots.iter() {
            let (key, _) = item.map_err(storage_err)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[..8]);
            let p = u64::from_be_bytes(buf);
            if p > period {
                batch.delete(Cf::PeriodData, key.to_vec());
                batch.delete(Cf::PbftBlocksByPeriod, key.to_vec());
                batch.delete(Cf::PbftCertVotesByPeriod, key.to_vec());
                batch.delete(Cf::FinalChainStateSnapshots, key.to_vec());
            }
        }
        info!(revert_to = period, staged = batch.len(), "reverting final chain");
        self.commit(batch)
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    pub fn stage_account(&self, batch: &mut WriteBatch, addr: &Address, account: &Account) {
        batch.put(
            Cf::StateTrieNodes,
            addr.as_bytes().to_vec(),
            rlp::encode(account).to_vec(),
        );
    }

    pub fn account(&self, addr: &Address) -> Result<Option<Account>, TrellisError> {
        self.decode_opt(self.state_trie_nodes.get(addr.as_bytes()).map_err(storage_err)?)
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    pub fn stage_snapshot(&self, batch: &mut WriteBatch, snapshot: &StateSnapshot) {
        batch.put(
            Cf::FinalChainStateSnapshots,
            Self::period_key(snapshot.period),
            rlp::encode(snapshot).to_vec(),
        );
    }

    pub fn snapshot(&self, period: Period) -> Result<Option<StateSnapshot>, TrellisError> {
        self.decode_opt(
            self.final_chain_state_snapshots
                .get(Self::period_key(period))
                .map_err(storage_err)?,
        )
    }

    /// The highest-period snapshot, if any (the persisted chain head).
    pub fn latest_snapshot(&self) -> Result<Option<StateSnapshot>, TrellisError> {
        match self.final_chain_state_snapshots.last().map_err(storage_err)? {
            Some((_, bytes)) => Ok(Some(rlp::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── Peer info (opaque to this layer) ─────────────────────────────────────

    pub fn put_peer_info(&self, peer_id: &[u8], value: &[u8]) -> Result<(), TrellisError> {
        self.peers.insert(peer_id, value).map_err(storage_err)?;
        Ok(())
    }

    pub fn peer_info(&self, peer_id: &[u8]) -> Result<Option<Vec<u8>>, TrellisError> {
        Ok(self
            .peers
            .get(peer_id)
            .map_err(storage_err)?
            .map(|v| v.to_vec()))
    }

    // ── Next-votes bundles ───────────────────────────────────────────────────

    pub fn put_next_votes_bundle(&self, bundle: &NextVotesBundle) -> Result<(), TrellisError> {
        self.next_votes_bundles
            .insert(
                Self::round_key(bundle.period, bundle.round),
                rlp::encode(bundle).to_vec(),
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn next_votes_bundle(
        &self,
        period: Period,
        round: Round,
    ) -> Result<Option<NextVotesBundle>, TrellisError> {
        self.decode_opt(
            self.next_votes_bundles
                .get(Self::round_key(period, round))
                .map_err(storage_err)?,
        )
    }

    fn decode_opt<T: Decodable>(&self, bytes: Option<sled::IVec>) -> Result<Option<T>, TrellisError> {
        match bytes {
            Some(bytes) => Ok(Some(rlp::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
