//! Pending-transaction pool.
//!
//! Three coupled indexes live behind one mutex: the hash index, per-sender
//! nonce maps, and the priority view derived from them. The comparator is
//! nonce-height based: within a sender only the lowest outstanding nonce is
//! eligible, and across senders eligible transactions compare by gas price.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use trellis_core::constants::DEFAULT_POOL_CAPACITY;
use trellis_core::error::TrellisError;
use trellis_core::transaction::Transaction;
use trellis_core::types::{Address, GasAmount, TxHash, U256};
use trellis_crypto::ecdsa::recover_transaction_sender;

/// Read-only view of account state the pool validates against.
pub trait AccountView {
    fn account_nonce(&self, addr: &Address) -> u64;
    fn account_balance(&self, addr: &Address) -> U256;
}

/// Outcome of [`TransactionPool::insert`].
#[derive(Debug)]
pub enum InsertResult {
    Inserted,
    Duplicate,
    Rejected(TrellisError),
}

impl InsertResult {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertResult::Inserted)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub capacity: usize,
    pub chain_id: u64,
    pub block_gas_limit: GasAmount,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            chain_id: 1,
            block_gas_limit: trellis_core::constants::DEFAULT_BLOCK_GAS_LIMIT,
        }
    }
}

/// One transaction slot under a sender's nonce: higher gas price sorts
/// first, ties broken by hash for determinism.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SenderSlot {
    gas_price: U256,
    hash: TxHash,
}

impl Ord for SenderSlot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .gas_price
            .cmp(&self.gas_price)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for SenderSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Heap candidate for `top(n)`: the best slot of one sender at its current
/// nonce height.
#[derive(PartialEq, Eq)]
struct Candidate {
    gas_price: U256,
    hash: TxHash,
    sender: Address,
    nonce: u64,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher gas price wins, then lower hash.
        self.gas_price
            .cmp(&other.gas_price)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    tx: Arc<Transaction>,
    sender: Address,
}

#[derive(Default)]
struct PoolInner {
    by_hash: HashMap<TxHash, Entry>,
    by_sender: HashMap<Address, BTreeMap<u64, BTreeSet<SenderSlot>>>,
    /// Hashes referenced by an in-flight period; never evicted.
    guarded: HashSet<TxHash>,
}

impl PoolInner {
    fn unlink(&mut self, hash: &TxHash) -> Option<Entry> {
        let entry = self.by_hash.remove(hash)?;
        if let Some(nonces) = self.by_sender.get_mut(&entry.sender) {
            if let Some(slots) = nonces.get_mut(&entry.tx.nonce) {
                slots.retain(|slot| slot.hash != *hash);
                if slots.is_empty() {
                    nonces.remove(&entry.tx.nonce);
                }
            }
            if nonces.is_empty() {
                self.by_sender.remove(&entry.sender);
            }
        }
        self.guarded.remove(hash);
        Some(entry)
    }

    /// Globally lowest-priority evictable transaction: among each sender's
    /// highest outstanding nonce, the cheapest gas price (ties: higher hash).
    fn eviction_victim(&self) -> Option<TxHash> {
        let mut victim: Option<(U256, TxHash)> = None;
        for nonces in self.by_sender.values() {
            let Some((_, slots)) = nonces.iter().next_back() else {
                continue;
            };
            // The worst slot under this nonce is the last in slot order.
            for slot in slots.iter().rev() {
                if self.guarded.contains(&slot.hash) {
                    continue;
                }
                let better_victim = match &victim {
                    None => true,
                    Some((price, hash)) => {
                        slot.gas_price < *price
                            || (slot.gas_price == *price && slot.hash > *hash)
                    }
                };
                if better_victim {
                    victim = Some((slot.gas_price, slot.hash));
                }
                break;
            }
        }
        victim.map(|(_, hash)| hash)
    }
}

/// The shared pending pool. Cheap to clone; all clones see one state.
#[derive(Clone)]
pub struct TransactionPool {
    config: PoolConfig,
    inner: Arc<Mutex<PoolInner>>,
}

impl TransactionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    /// Validate and insert a transaction.
    pub fn insert(&self, tx: Transaction, view: &dyn AccountView) -> InsertResult {
        let hash = tx.hash();
        if let Err(e) = tx.validate(self.config.chain_id, self.config.block_gas_limit) {
            return InsertResult::Rejected(e);
        }
        let sender = match recover_transaction_sender(&tx) {
            Ok(sender) => sender,
            Err(e) => return InsertResult::Rejected(e),
        };
        let account_nonce = view.account_nonce(&sender);
        if tx.nonce < account_nonce {
            return InsertResult::Rejected(TrellisError::NonceTooLow {
                account: account_nonce,
                got: tx.nonce,
            });
        }
        let need = tx.max_cost();
        let have = view.account_balance(&sender);
        if have < need {
            return InsertResult::Rejected(TrellisError::InsufficientBalance {
                need: need.to_string(),
                have: have.to_string(),
            });
        }

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        if inner.by_hash.contains_key(&hash) {
            return InsertResult::Duplicate;
        }

        if inner.by_hash.len() >= self.config.capacity {
            match inner.eviction_victim() {
                Some(victim) if victim != hash => {
                    debug!(evicted = %victim, "pool full, evicting lowest priority");
                    inner.unlink(&victim);
                }
                _ => return InsertResult::Rejected(TrellisError::PoolFull),
            }
        }

        let slot = SenderSlot {
            gas_price: tx.gas_price,
            hash,
        };
        inner
            .by_sender
            .entry(sender)
            .or_default()
            .entry(tx.nonce)
            .or_default()
            .insert(slot);
        inner.by_hash.insert(
            hash,
            Entry {
                tx: Arc::new(tx),
                sender,
            },
        );
        InsertResult::Inserted
    }

    /// Remove a transaction; returns whether it was present.
    pub fn remove(&self, hash: &TxHash) -> bool {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.unlink(hash).is_some()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .by_hash
            .contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<Arc<Transaction>> {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .by_hash
            .get(hash)
            .map(|e| Arc::clone(&e.tx))
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").by_hash.len()
    }

    /// First `n` transactions in priority order: per sender strictly by
    /// nonce, across senders by gas price at each sender's current height.
    pub fn top(&self, n: usize) -> Vec<Arc<Transaction>> {
        let inner = self.inner.lock().expect("pool lock poisoned");
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
        for (sender, nonces) in &inner.by_sender {
            if let Some((nonce, slots)) = nonces.iter().next() {
                let best = slots.iter().next().expect("non-empty slot set");
                heap.push(Candidate {
                    gas_price: best.gas_price,
                    hash: best.hash,
                    sender: *sender,
                    nonce: *nonce,
                });
            }
        }

        let mut out = Vec::with_capacity(n.min(inner.by_hash.len()));
        while out.len() < n {
            let Some(candidate) = heap.pop() else { break };
            let entry = &inner.by_hash[&candidate.hash];
            out.push(Arc::clone(&entry.tx));

            // Advance this sender to its next nonce.
            if let Some(nonces) = inner.by_sender.get(&candidate.sender) {
                if let Some((nonce, slots)) = nonces
                    .range((candidate.nonce + 1)..)
                    .next()
                {
                    let best = slots.iter().next().expect("non-empty slot set");
                    heap.push(Candidate {
                        gas_price: best.gas_price,
                        hash: best.hash,
                        sender: candidate.sender,
                        nonce: *nonce,
                    });
                }
            }
        }
        out
    }

    /// Protect period-referenced transactions from eviction.
    pub fn guard(&self, hashes: &[TxHash]) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        for h in hashes {
            if inner.by_hash.contains_key(h) {
                inner.guarded.insert(*h);
            }
        }
    }

    /// Drop the eviction guard (period finalized or abandoned).
    pub fn unguard(&self, hashes: &[TxHash]) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        for h in hashes {
            inner.guarded.remove(h);
        }
    }
}
