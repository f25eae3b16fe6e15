use std::sync::OnceLock;

use once_cell::sync::Lazy;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::encoding::{expect_list_size, keccak256};
use crate::error::TrellisError;
use crate::types::{Address, GasAmount, Signature, TxHash, H256, U256};

/// secp256k1 group order halved: signatures with `s` above this are
/// non-canonical and rejected (low-s rule).
pub static SECP256K1_HALF_N: Lazy<U256> = Lazy::new(|| {
    U256::from_big_endian(&[
        0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b,
        0x20, 0xa0,
    ])
});

/// A signed Trellis transaction.
///
/// The hash — the value that is signed and that identifies the transaction
/// everywhere (pool, DAG blocks, receipts) — is Keccak-256 of the canonical
/// RLP of the unsigned fields plus `chain_id`. The sender is not a field; it
/// is recovered from the signature.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: GasAmount,
    /// `None` means contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
    pub sig: Signature,

    cached_hash: OnceLock<H256>,
}

impl Transaction {
    pub fn new_unsigned(
        nonce: u64,
        gas_price: U256,
        gas: GasAmount,
        to: Option<Address>,
        value: U256,
        data: Vec<u8>,
        chain_id: u64,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            to,
            value,
            data,
            chain_id,
            sig: Signature::default(),
            cached_hash: OnceLock::new(),
        }
    }

    /// RLP over the unsigned fields plus chain id. This is both the signing
    /// message and the preimage of [`Transaction::hash`].
    pub fn unsigned_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(7);
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        match &self.to {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.data);
        s.append(&self.chain_id);
        s.out().to_vec()
    }

    pub fn hash(&self) -> TxHash {
        *self
            .cached_hash
            .get_or_init(|| keccak256(&self.unsigned_rlp()))
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Upper bound on what executing this transaction can cost the sender.
    pub fn max_cost(&self) -> U256 {
        self.value + self.gas_price * U256::from(self.gas)
    }

    /// Structural checks that need no key material: chain id, gas limit and
    /// the low-s rule. Signature recovery lives in the crypto crate.
    pub fn validate(&self, chain_id: u64, block_gas_limit: GasAmount) -> Result<(), TrellisError> {
        if self.chain_id != chain_id {
            return Err(TrellisError::ChainIdMismatch {
                expected: chain_id,
                got: self.chain_id,
            });
        }
        if self.gas > block_gas_limit {
            return Err(TrellisError::GasLimitTooHigh {
                got: self.gas,
                limit: block_gas_limit,
            });
        }
        let s_value = U256::from_big_endian(self.sig.s().as_bytes());
        if s_value > *SECP256K1_HALF_N {
            return Err(TrellisError::HighS);
        }
        Ok(())
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.nonce == other.nonce
            && self.gas_price == other.gas_price
            && self.gas == other.gas
            && self.to == other.to
            && self.value == other.value
            && self.data == other.data
            && self.chain_id == other.chain_id
            && self.sig == other.sig
    }
}

impl Eq for Transaction {}

impl Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(10);
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas);
        match &self.to {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.data);
        s.append(&self.chain_id);
        s.append(&self.sig.v());
        s.append(&self.sig.r());
        s.append(&self.sig.s());
    }
}

impl Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 10)?;
        let to_item = rlp.at(3)?;
        let to = if to_item.is_empty() {
            None
        } else {
            Some(to_item.as_val::<Address>()?)
        };
        let v: u8 = rlp.val_at(7)?;
        let r: H256 = rlp.val_at(8)?;
        let s_field: H256 = rlp.val_at(9)?;
        Ok(Self {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            data: rlp.val_at(5)?,
            chain_id: rlp.val_at(6)?,
            sig: Signature::from_rsv(&r, &s_field, v),
            cached_hash: OnceLock::new(),
        })
    }
}
