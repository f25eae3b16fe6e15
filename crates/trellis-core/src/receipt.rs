use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::encoding::expect_list_size;
use crate::types::{Address, Bloom, BloomInput, H256};

/// A single log record emitted during execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl LogEntry {
    /// Bloom over the log address and every topic.
    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::zero();
        bloom.accrue(BloomInput::Raw(self.address.as_bytes()));
        for topic in &self.topics {
            bloom.accrue(BloomInput::Raw(topic.as_bytes()));
        }
        bloom
    }
}

impl Encodable for LogEntry {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        s.append_list(&self.topics);
        s.append(&self.data);
    }
}

impl Decodable for LogEntry {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 3)?;
        Ok(Self {
            address: rlp.val_at(0)?,
            topics: rlp.list_at(1)?,
            data: rlp.val_at(2)?,
        })
    }
}

/// Execution result of one transaction within a finalized period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// 1 = success, 0 = reverted/failed.
    pub status_code: u8,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub logs: Vec<LogEntry>,
    pub new_contract_address: Option<Address>,
}

impl Receipt {
    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::zero();
        for log in &self.logs {
            bloom.accrue_bloom(&log.bloom());
        }
        bloom
    }
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.status_code);
        s.append(&self.gas_used);
        s.append(&self.cumulative_gas_used);
        s.append_list(&self.logs);
        match &self.new_contract_address {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
    }
}

impl Decodable for Receipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 5)?;
        let addr_item = rlp.at(4)?;
        let new_contract_address = if addr_item.is_empty() {
            None
        } else {
            Some(addr_item.as_val::<Address>()?)
        };
        Ok(Self {
            status_code: rlp.val_at(0)?,
            gas_used: rlp.val_at(1)?,
            cumulative_gas_used: rlp.val_at(2)?,
            logs: rlp.list_at(3)?,
            new_contract_address,
        })
    }
}
