use std::sync::OnceLock;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use trellis_core::encoding::{expect_list_size, keccak256, ordered_items_hash};
use trellis_core::error::TrellisError;
use trellis_core::types::{Address, BlockHash, Period, Signature, TxHash, H256};
use trellis_crypto::ecdsa::{recover_signer, KeyPair};

/// The block a committee finalizes once per period. It does not carry
/// transactions itself; it anchors a DAG subgraph and commits to its
/// canonical order via `order_hash`.
#[derive(Clone, Debug)]
pub struct PbftBlock {
    pub period: Period,
    pub prev_block_hash: BlockHash,
    /// The DAG anchor whose ancestry forms the period set.
    pub dag_block_hash: BlockHash,
    /// Commitment to the period's DAG-block order and transaction order.
    pub order_hash: H256,
    pub beneficiary: Address,
    pub timestamp: u64,
    pub signature: Signature,

    cached_hash: OnceLock<H256>,
}

impl PbftBlock {
    pub fn new(
        period: Period,
        prev_block_hash: BlockHash,
        dag_block_hash: BlockHash,
        order_hash: H256,
        beneficiary: Address,
        timestamp: u64,
    ) -> Self {
        Self {
            period,
            prev_block_hash,
            dag_block_hash,
            order_hash,
            beneficiary,
            timestamp,
            signature: Signature::default(),
            cached_hash: OnceLock::new(),
        }
    }

    /// The deterministic order commitment: RLP list of the period's DAG
    /// block hashes in canonical order, followed by the RLP list of its
    /// transaction hashes in concatenated first-inclusion order.
    pub fn compute_order_hash(dag_hashes: &[BlockHash], tx_hashes: &[TxHash]) -> H256 {
        let mut s = RlpStream::new_list(2);
        s.append(&ordered_items_hash(dag_hashes));
        s.append(&ordered_items_hash(tx_hashes));
        keccak256(&s.out())
    }

    fn unsigned_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(6);
        s.append(&self.period);
        s.append(&self.prev_block_hash);
        s.append(&self.dag_block_hash);
        s.append(&self.order_hash);
        s.append(&self.beneficiary);
        s.append(&self.timestamp);
        s.out().to_vec()
    }

    pub fn hash(&self) -> BlockHash {
        *self
            .cached_hash
            .get_or_init(|| keccak256(&self.unsigned_rlp()))
    }

    pub fn sign(&mut self, kp: &KeyPair) {
        self.signature = kp.sign(&self.hash());
    }

    pub fn author(&self) -> Result<Address, TrellisError> {
        recover_signer(&self.signature, &self.hash())
    }
}

impl PartialEq for PbftBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash() && self.signature == other.signature
    }
}

impl Eq for PbftBlock {}

impl Encodable for PbftBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.period);
        s.append(&self.prev_block_hash);
        s.append(&self.dag_block_hash);
        s.append(&self.order_hash);
        s.append(&self.beneficiary);
        s.append(&self.timestamp);
        s.append(&self.signature);
    }
}

impl Decodable for PbftBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 7)?;
        Ok(Self {
            period: rlp.val_at(0)?,
            prev_block_hash: rlp.val_at(1)?,
            dag_block_hash: rlp.val_at(2)?,
            order_hash: rlp.val_at(3)?,
            beneficiary: rlp.val_at(4)?,
            timestamp: rlp.val_at(5)?,
            signature: rlp.val_at(6)?,
            cached_hash: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_round_trip_and_author() {
        let kp = KeyPair::generate();
        let mut block = PbftBlock::new(
            3,
            H256::repeat_byte(1),
            H256::repeat_byte(2),
            H256::repeat_byte(3),
            kp.address,
            1_700_000_123,
        );
        block.sign(&kp);
        let back: PbftBlock = rlp::decode(&rlp::encode(&block)).unwrap();
        assert_eq!(block, back);
        assert_eq!(back.author().unwrap(), kp.address);
    }

    #[test]
    fn order_hash_sensitive_to_both_lists() {
        let d1 = vec![H256::repeat_byte(1)];
        let d2 = vec![H256::repeat_byte(2)];
        let t1 = vec![H256::repeat_byte(3)];
        let t2 = vec![H256::repeat_byte(4)];
        let base = PbftBlock::compute_order_hash(&d1, &t1);
        assert_ne!(base, PbftBlock::compute_order_hash(&d2, &t1));
        assert_ne!(base, PbftBlock::compute_order_hash(&d1, &t2));
    }
}
