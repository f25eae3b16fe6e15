use std::sync::OnceLock;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use trellis_core::encoding::{expect_list_size, keccak256};
use trellis_core::error::TrellisError;
use trellis_core::types::{
    Address, BlockHash, Level, Signature, TxHash, VrfProof, H256, NULL_BLOCK_HASH,
};
use trellis_crypto::ecdsa::{recover_signer, KeyPair};
use trellis_crypto::vdf::VdfProof;

/// A block in the transaction DAG.
///
/// The hash covers everything except `author_sig` (the signature is over the
/// hash, so including it would be circular). Blocks are immutable once
/// inserted into the DAG manager.
#[derive(Clone, Debug)]
pub struct DagBlock {
    /// Parent on the pivot chain. `NULL_BLOCK_HASH` only on genesis.
    pub pivot: BlockHash,
    /// Extra parents beyond the pivot.
    pub tips: Vec<BlockHash>,
    /// 1 + max level over pivot and tips.
    pub level: Level,
    /// Proposer wall clock, seconds.
    pub timestamp: u64,
    pub vdf: VdfProof,
    pub vrf: VrfProof,
    /// Hashes of the transactions this block packages, in inclusion order.
    pub transactions: Vec<TxHash>,
    pub author_sig: Signature,

    cached_hash: OnceLock<H256>,
}

impl DagBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pivot: BlockHash,
        tips: Vec<BlockHash>,
        level: Level,
        timestamp: u64,
        vdf: VdfProof,
        vrf: VrfProof,
        transactions: Vec<TxHash>,
    ) -> Self {
        Self {
            pivot,
            tips,
            level,
            timestamp,
            vdf,
            vrf,
            transactions,
            author_sig: Signature::default(),
            cached_hash: OnceLock::new(),
        }
    }

    /// The level-0 block every chain starts from.
    pub fn genesis() -> Self {
        Self::new(
            NULL_BLOCK_HASH,
            vec![],
            0,
            0,
            VdfProof::default(),
            VrfProof::default(),
            vec![],
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.pivot == NULL_BLOCK_HASH && self.level == 0
    }

    fn unsigned_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(7);
        s.append(&self.pivot);
        s.append_list(&self.tips);
        s.append(&self.level);
        s.append(&self.timestamp);
        s.append(&self.vdf);
        s.append(&self.vrf);
        s.append_list(&self.transactions);
        s.out().to_vec()
    }

    pub fn hash(&self) -> BlockHash {
        *self
            .cached_hash
            .get_or_init(|| keccak256(&self.unsigned_rlp()))
    }

    /// All parents: pivot first, then tips.
    pub fn parents(&self) -> impl Iterator<Item = &BlockHash> {
        std::iter::once(&self.pivot).chain(self.tips.iter())
    }

    pub fn sign(&mut self, kp: &KeyPair) {
        self.author_sig = kp.sign(&self.hash());
    }

    pub fn author(&self) -> Result<Address, TrellisError> {
        recover_signer(&self.author_sig, &self.hash())
    }

    /// The VDF input this block's proof must verify against.
    pub fn vdf_challenge(level: Level, period_hash: &H256) -> Vec<u8> {
        let mut s = RlpStream::new_list(2);
        s.append(&level);
        s.append(period_hash);
        s.out().to_vec()
    }
}

impl PartialEq for DagBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash() && self.author_sig == other.author_sig
    }
}

impl Eq for DagBlock {}

impl Encodable for DagBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8);
        s.append(&self.pivot);
        s.append_list(&self.tips);
        s.append(&self.level);
        s.append(&self.timestamp);
        s.append(&self.vdf);
        s.append(&self.vrf);
        s.append_list(&self.transactions);
        s.append(&self.author_sig);
    }
}

impl Decodable for DagBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 8)?;
        Ok(Self {
            pivot: rlp.val_at(0)?,
            tips: rlp.list_at(1)?,
            level: rlp.val_at(2)?,
            timestamp: rlp.val_at(3)?,
            vdf: rlp.val_at(4)?,
            vrf: rlp.val_at(5)?,
            transactions: rlp.list_at(6)?,
            author_sig: rlp.val_at(7)?,
            cached_hash: OnceLock::new(),
        })
    }
}
