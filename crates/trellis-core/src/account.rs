use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::constants::{EMPTY_CODE_HASH, EMPTY_ROOT_HASH};
use crate::types::{H256, U256};

/// Account state record. A missing entry is equivalent to
/// [`Account::default`] (zero-initialized).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
    pub code_size: u64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: *EMPTY_ROOT_HASH,
            code_hash: *EMPTY_CODE_HASH,
            code_size: 0,
        }
    }
}

impl Account {
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_size == 0
    }
}

impl Encodable for Account {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.nonce);
        s.append(&self.balance);
        s.append(&self.storage_root);
        s.append(&self.code_hash);
        s.append(&self.code_size);
    }
}

impl Decodable for Account {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        crate::encoding::expect_list_size(rlp, 5)?;
        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            storage_root: rlp.val_at(2)?,
            code_hash: rlp.val_at(3)?,
            code_size: rlp.val_at(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zero_initialized() {
        let acc = Account::default();
        assert_eq!(acc.nonce, 0);
        assert!(acc.balance.is_zero());
        assert!(acc.is_empty());
    }

    #[test]
    fn rlp_round_trip() {
        let acc = Account {
            nonce: 4,
            balance: U256::from(99_999u64),
            ..Account::default()
        };
        let back: Account = rlp::decode(&rlp::encode(&acc)).unwrap();
        assert_eq!(acc, back);
    }
}
