//! Per-peer bookkeeping and the shared peer table.
//!
//! The table is read-mostly (every broadcast walks it) and guarded by a
//! shared lock; individual peers carry their own mutex so updating one
//! peer's known-caches never blocks the rest. Misbehavior feeds a sliding
//! suspicion window — throttle first, then disconnect into a time-bounded
//! blacklist.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use libp2p::PeerId;
use tracing::{info, warn};

use trellis_core::constants::{PEER_BLACKLIST_TIMEOUT_SECS, PEER_SUSPICION_WINDOW_SECS};
use trellis_core::types::{BlockHash, Level, Period, Round, TxHash, H256};

#[derive(Clone, Copy, Debug)]
pub struct PeerConfig {
    /// Suspicious packets tolerated inside the sliding window.
    pub suspicion_threshold: usize,
    pub suspicion_window: Duration,
    pub blacklist_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: 16,
            suspicion_window: Duration::from_secs(PEER_SUSPICION_WINDOW_SECS),
            blacklist_timeout: Duration::from_secs(PEER_BLACKLIST_TIMEOUT_SECS),
        }
    }
}

/// What this node knows about one connected peer.
#[derive(Debug)]
pub struct PeerState {
    pub id: PeerId,
    pub pbft_period: Period,
    pub pbft_round: Round,
    pub dag_level: Level,
    pub syncing: bool,
    pub is_light_node: bool,
    known_dag_blocks: HashSet<BlockHash>,
    known_transactions: HashSet<TxHash>,
    known_votes: HashSet<H256>,
    suspicion: VecDeque<Instant>,
    pub malicious_score: u32,
}

impl PeerState {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            pbft_period: 0,
            pbft_round: 0,
            dag_level: 0,
            syncing: false,
            is_light_node: false,
            known_dag_blocks: HashSet::new(),
            known_transactions: HashSet::new(),
            known_votes: HashSet::new(),
            suspicion: VecDeque::new(),
            malicious_score: 0,
        }
    }

    pub fn mark_dag_block_known(&mut self, hash: BlockHash) {
        self.known_dag_blocks.insert(hash);
    }

    pub fn knows_dag_block(&self, hash: &BlockHash) -> bool {
        self.known_dag_blocks.contains(hash)
    }

    pub fn mark_transaction_known(&mut self, hash: TxHash) {
        self.known_transactions.insert(hash);
    }

    pub fn knows_transaction(&self, hash: &TxHash) -> bool {
        self.known_transactions.contains(hash)
    }

    pub fn mark_vote_known(&mut self, hash: H256) {
        self.known_votes.insert(hash);
    }

    pub fn knows_vote(&self, hash: &H256) -> bool {
        self.known_votes.contains(hash)
    }

    /// Record a suspicious packet; returns how many landed inside the
    /// window.
    fn record_suspicion(&mut self, now: Instant, window: Duration) -> usize {
        self.suspicion.push_back(now);
        while let Some(front) = self.suspicion.front() {
            if now.duration_since(*front) > window {
                self.suspicion.pop_front();
            } else {
                break;
            }
        }
        self.malicious_score += 1;
        self.suspicion.len()
    }
}

/// Shared table of connected peers plus the blacklist.
pub struct PeerTable {
    config: PeerConfig,
    peers: RwLock<HashMap<PeerId, Mutex<PeerState>>>,
    blacklist: Mutex<HashMap<PeerId, Instant>>,
}

impl PeerTable {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            blacklist: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: PeerId) -> bool {
        if self.is_blacklisted(&id) {
            return false;
        }
        let mut peers = self.peers.write().expect("peer table lock");
        peers.entry(id).or_insert_with(|| Mutex::new(PeerState::new(id)));
        true
    }

    pub fn deregister(&self, id: &PeerId) {
        self.peers.write().expect("peer table lock").remove(id);
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().expect("peer table lock").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .expect("peer table lock")
            .keys()
            .copied()
            .collect()
    }

    /// Run `f` with the peer's state locked. No-op if unknown.
    pub fn with_peer<R>(&self, id: &PeerId, f: impl FnOnce(&mut PeerState) -> R) -> Option<R> {
        let peers = self.peers.read().expect("peer table lock");
        peers.get(id).map(|p| f(&mut p.lock().expect("peer lock")))
    }

    /// The best-progressed peer to sync from, if anyone is ahead of
    /// `our_period`.
    pub fn best_sync_candidate(&self, our_period: Period) -> Option<(PeerId, Period)> {
        let peers = self.peers.read().expect("peer table lock");
        peers
            .values()
            .map(|p| {
                let p = p.lock().expect("peer lock");
                (p.id, p.pbft_period)
            })
            .filter(|(_, period)| *period > our_period)
            .max_by_key(|(_, period)| *period)
    }

    /// Record misbehavior that is suspicious but not immediately fatal.
    /// Returns true when the peer crossed the throttle threshold and must be
    /// dropped.
    pub fn report_suspicious(&self, id: &PeerId) -> bool {
        let over = self
            .with_peer(id, |p| {
                p.record_suspicion(Instant::now(), self.config.suspicion_window)
                    > self.config.suspicion_threshold
            })
            .unwrap_or(false);
        if over {
            warn!(peer = %id, "peer exceeded suspicion threshold");
            self.blacklist(id, "suspicion threshold");
        }
        over
    }

    /// Fatal misbehavior: drop and blacklist for the configured timeout.
    pub fn blacklist(&self, id: &PeerId, reason: &str) {
        info!(peer = %id, reason, "blacklisting peer");
        self.deregister(id);
        self.blacklist
            .lock()
            .expect("blacklist lock")
            .insert(*id, Instant::now() + self.config.blacklist_timeout);
    }

    pub fn is_blacklisted(&self, id: &PeerId) -> bool {
        let mut blacklist = self.blacklist.lock().expect("blacklist lock");
        match blacklist.get(id) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                blacklist.remove(id);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(threshold: usize) -> PeerTable {
        PeerTable::new(PeerConfig {
            suspicion_threshold: threshold,
            suspicion_window: Duration::from_secs(10),
            blacklist_timeout: Duration::from_secs(600),
        })
    }

    #[test]
    fn register_and_track_known_hashes() {
        let table = table(4);
        let id = PeerId::random();
        assert!(table.register(id));
        let hash = BlockHash::repeat_byte(1);
        table.with_peer(&id, |p| p.mark_dag_block_known(hash));
        assert_eq!(table.with_peer(&id, |p| p.knows_dag_block(&hash)), Some(true));
        assert_eq!(
            table.with_peer(&id, |p| p.knows_dag_block(&BlockHash::repeat_byte(2))),
            Some(false)
        );
    }

    #[test]
    fn suspicion_threshold_blacklists() {
        let table = table(2);
        let id = PeerId::random();
        table.register(id);
        assert!(!table.report_suspicious(&id));
        assert!(!table.report_suspicious(&id));
        assert!(table.report_suspicious(&id), "third strike crosses threshold");
        assert!(table.is_blacklisted(&id));
        assert!(!table.contains(&id));
        assert!(!table.register(id), "blacklisted peers cannot reconnect");
    }

    #[test]
    fn best_sync_candidate_prefers_highest_period() {
        let table = table(4);
        let a = PeerId::random();
        let b = PeerId::random();
        table.register(a);
        table.register(b);
        table.with_peer(&a, |p| p.pbft_period = 10);
        table.with_peer(&b, |p| p.pbft_period = 25);
        let (best, period) = table.best_sync_candidate(5).unwrap();
        assert_eq!(best, b);
        assert_eq!(period, 25);
        assert!(table.best_sync_candidate(30).is_none());
    }
}
