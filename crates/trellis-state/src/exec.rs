//! The execution seam.
//!
//! The real EVM is an external collaborator behind [`Execution`]: a pure
//! function from (state, block context, transaction) to (state', receipt).
//! [`TransferVm`] is the built-in implementation covering plain value
//! transfers with intrinsic-gas accounting, enough to run the chain end to
//! end without an interpreter.

use std::collections::BTreeMap;

use trellis_core::account::Account;
use trellis_core::constants::MIN_TRANSACTION_GAS;
use trellis_core::receipt::Receipt;
use trellis_core::transaction::Transaction;
use trellis_core::types::{Address, Period, U256};

use crate::db::StateDb;

/// Block-level inputs every transaction of a period executes under.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext {
    pub author: Address,
    pub timestamp: u64,
    pub gas_limit: u64,
    /// Block number == period.
    pub number: Period,
}

/// Staged account mutations over the persisted state. Reads fall through to
/// the DB; writes stay here until the period commits. BTreeMap keeps the
/// change list in address order for the rolling state root.
pub struct StateOverlay<'a> {
    db: &'a StateDb,
    dirty: BTreeMap<Address, Account>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(db: &'a StateDb) -> Self {
        Self {
            db,
            dirty: BTreeMap::new(),
        }
    }

    /// Missing entries read as zero-initialized accounts.
    pub fn account(&self, addr: &Address) -> Account {
        if let Some(acc) = self.dirty.get(addr) {
            return acc.clone();
        }
        self.db.account(addr).ok().flatten().unwrap_or_default()
    }

    pub fn set_account(&mut self, addr: Address, account: Account) {
        self.dirty.insert(addr, account);
    }

    pub fn credit(&mut self, addr: Address, amount: U256) {
        let mut account = self.account(&addr);
        account.balance += amount;
        self.set_account(addr, account);
    }

    /// Address-ordered view of everything this period changed.
    pub fn changes(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.dirty.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}

/// One transaction's execution.
pub trait Execution: Send + Sync {
    /// Apply `tx` (with pre-recovered `sender`) to the overlay. Never fails
    /// the period: an unexecutable transaction yields a status-0 receipt.
    fn transact(
        &self,
        state: &mut StateOverlay<'_>,
        ctx: &BlockContext,
        tx: &Transaction,
        sender: Address,
    ) -> Receipt;
}

/// Plain value transfer with the 21 000-gas intrinsic charge. Contract
/// creation and calls with payloads are rejected (status 0) — that is the
/// interpreter's territory.
pub struct TransferVm;

impl TransferVm {
    fn failed(gas_used: u64, cumulative: u64) -> Receipt {
        Receipt {
            status_code: 0,
            gas_used,
            cumulative_gas_used: cumulative,
            logs: vec![],
            new_contract_address: None,
        }
    }
}

impl Execution for TransferVm {
    fn transact(
        &self,
        state: &mut StateOverlay<'_>,
        _ctx: &BlockContext,
        tx: &Transaction,
        sender: Address,
    ) -> Receipt {
        let Some(to) = tx.to else {
            return Self::failed(0, 0);
        };
        if !tx.data.is_empty() || tx.gas < MIN_TRANSACTION_GAS {
            return Self::failed(0, 0);
        }

        let mut from = state.account(&sender);
        if tx.nonce != from.nonce {
            return Self::failed(0, 0);
        }
        let fee = tx.gas_price * U256::from(MIN_TRANSACTION_GAS);
        let cost = tx.value + fee;
        if from.balance < cost {
            return Self::failed(0, 0);
        }

        from.balance -= cost;
        from.nonce += 1;
        state.set_account(sender, from);
        state.credit(to, tx.value);

        Receipt {
            status_code: 1,
            gas_used: MIN_TRANSACTION_GAS,
            cumulative_gas_used: 0, // filled by the finalizer
            logs: vec![],
            new_contract_address: None,
        }
    }
}

/// The fee a successful transaction pays its first includer.
pub fn transaction_fee(tx: &Transaction, receipt: &Receipt) -> U256 {
    if receipt.status_code == 1 {
        tx.gas_price * U256::from(receipt.gas_used)
    } else {
        U256::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BlockContext {
        BlockContext {
            author: Address::repeat_byte(0xAA),
            timestamp: 0,
            gas_limit: 10_000_000,
            number: 1,
        }
    }

    fn transfer(nonce: u64, value: u64, gas_price: u64) -> Transaction {
        Transaction::new_unsigned(
            nonce,
            U256::from(gas_price),
            21_000,
            Some(Address::repeat_byte(2)),
            U256::from(value),
            vec![],
            1,
        )
    }

    #[test]
    fn transfer_moves_value_and_charges_fee() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let sender = Address::repeat_byte(1);
        let mut overlay = StateOverlay::new(&db);
        overlay.set_account(sender, Account::with_balance(U256::from(100_000u64)));

        let tx = transfer(0, 1, 1);
        let receipt = TransferVm.transact(&mut overlay, &ctx(), &tx, sender);
        assert_eq!(receipt.status_code, 1);
        assert_eq!(receipt.gas_used, 21_000);

        let from = overlay.account(&sender);
        assert_eq!(from.balance, U256::from(100_000u64 - 1 - 21_000));
        assert_eq!(from.nonce, 1);
        assert_eq!(
            overlay.account(&Address::repeat_byte(2)).balance,
            U256::from(1u64)
        );
        assert_eq!(transaction_fee(&tx, &receipt), U256::from(21_000u64));
    }

    #[test]
    fn wrong_nonce_fails_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let sender = Address::repeat_byte(1);
        let mut overlay = StateOverlay::new(&db);
        overlay.set_account(sender, Account::with_balance(U256::from(100_000u64)));

        let receipt = TransferVm.transact(&mut overlay, &ctx(), &transfer(5, 1, 1), sender);
        assert_eq!(receipt.status_code, 0);
        assert_eq!(overlay.account(&sender).balance, U256::from(100_000u64));
        assert_eq!(transaction_fee(&transfer(5, 1, 1), &receipt), U256::zero());
    }

    #[test]
    fn insufficient_balance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let sender = Address::repeat_byte(1);
        let mut overlay = StateOverlay::new(&db);
        overlay.set_account(sender, Account::with_balance(U256::from(10u64)));

        let receipt = TransferVm.transact(&mut overlay, &ctx(), &transfer(0, 1, 1), sender);
        assert_eq!(receipt.status_code, 0);
    }

    #[test]
    fn contract_creation_rejected_by_transfer_vm() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(dir.path()).unwrap();
        let sender = Address::repeat_byte(1);
        let mut overlay = StateOverlay::new(&db);
        overlay.set_account(sender, Account::with_balance(U256::from(100_000u64)));

        let mut tx = transfer(0, 1, 1);
        tx.to = None;
        let receipt = TransferVm.transact(&mut overlay, &ctx(), &tx, sender);
        assert_eq!(receipt.status_code, 0);
    }
}
