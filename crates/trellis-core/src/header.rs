use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::constants::EMPTY_LIST_HASH;
use crate::encoding::{expect_list_size, keccak256};
use crate::types::{Address, Bloom, H256, U256};

/// Execution result header for one finalized period.
///
/// Hashing uses the Ethereum-compatible 15-field form (see
/// [`BlockHeader::ethereum_rlp`]) where fields this chain does not produce
/// — ommers, difficulty, mix hash, the 8-byte nonce — take their canonical
/// empty values. Persistence uses the full 13-field record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub log_bloom: Bloom,
    /// Block number == period.
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub extra_data: Vec<u8>,
    pub timestamp: u64,
    pub author: Address,
    pub total_reward: U256,
    /// Byte length of the Ethereum-form encoding.
    pub size: u64,
}

impl BlockHeader {
    /// The 15-field Ethereum-compatible encoding the header hash is taken
    /// over.
    pub fn ethereum_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(15);
        s.append(&self.parent_hash);
        s.append(&*EMPTY_LIST_HASH);
        s.append(&self.author);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.log_bloom);
        s.append(&U256::zero()); // difficulty
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&self.extra_data);
        s.append(&H256::zero()); // mix hash
        s.append(&vec![0u8; 8]); // nonce
        s.out().to_vec()
    }

    pub fn hash(&self) -> H256 {
        keccak256(&self.ethereum_rlp())
    }

    /// Fill in `size` from the Ethereum-form encoding length.
    pub fn seal_size(&mut self) {
        self.size = self.ethereum_rlp().len() as u64;
    }
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(13);
        s.append(&self.parent_hash);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.log_bloom);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.extra_data);
        s.append(&self.timestamp);
        s.append(&self.author);
        s.append(&self.total_reward);
        s.append(&self.size);
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 13)?;
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            state_root: rlp.val_at(1)?,
            transactions_root: rlp.val_at(2)?,
            receipts_root: rlp.val_at(3)?,
            log_bloom: rlp.val_at(4)?,
            number: rlp.val_at(5)?,
            gas_limit: rlp.val_at(6)?,
            gas_used: rlp.val_at(7)?,
            extra_data: rlp.val_at(8)?,
            timestamp: rlp.val_at(9)?,
            author: rlp.val_at(10)?,
            total_reward: rlp.val_at(11)?,
            size: rlp.val_at(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EMPTY_ROOT_HASH;

    fn sample_header() -> BlockHeader {
        let mut h = BlockHeader {
            parent_hash: H256::repeat_byte(1),
            state_root: H256::repeat_byte(2),
            transactions_root: *EMPTY_ROOT_HASH,
            receipts_root: *EMPTY_ROOT_HASH,
            log_bloom: Bloom::zero(),
            number: 5,
            gas_limit: 10_000_000,
            gas_used: 21_000,
            extra_data: vec![],
            timestamp: 1_700_000_000,
            author: Address::repeat_byte(7),
            total_reward: U256::from(1000u64),
            size: 0,
        };
        h.seal_size();
        h
    }

    #[test]
    fn rlp_round_trip() {
        let header = sample_header();
        let back: BlockHeader = rlp::decode(&rlp::encode(&header)).unwrap();
        assert_eq!(header, back);
        assert_eq!(header.hash(), back.hash());
    }

    #[test]
    fn hash_is_over_ethereum_form() {
        let mut a = sample_header();
        let b = sample_header();
        // total_reward is not part of the Ethereum form, so the hash must not
        // change with it.
        a.total_reward = U256::from(9_999u64);
        assert_eq!(a.hash(), b.hash());
        a.gas_used = 0;
        assert_ne!(a.hash(), b.hash());
    }
}
