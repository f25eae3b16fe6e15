//! Append-only DAG with pivot and tip selection.
//!
//! Insertion is validated in a fixed order (parents, VDF, signature, level)
//! so peers observing a rejection can tell a gap from a forgery. The pivot
//! child of a block is its heaviest child by cumulative pivot-subtree
//! weight, ties broken by lowest hash; period extraction walks the anchor's
//! ancestry in a deterministic parent-before-child order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use trellis_core::error::TrellisError;
use trellis_core::types::{BlockHash, Level, Period, H256};
use trellis_crypto::vdf::verify_vdf;

use crate::block::DagBlock;

/// Anchor-selection knobs (§period anchoring).
#[derive(Clone, Copy, Debug)]
pub struct GhostConfig {
    /// How many levels past the previous anchor the new anchor may reach.
    pub max_ghost_size: u64,
    /// Pivot-chain steps walked back per correction.
    pub ghost_path_move_back: u64,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            max_ghost_size: trellis_core::constants::DEFAULT_MAX_GHOST_SIZE,
            ghost_path_move_back: trellis_core::constants::DEFAULT_GHOST_PATH_MOVE_BACK,
        }
    }
}

struct DagInner {
    blocks: HashMap<BlockHash, Arc<DagBlock>>,
    children: HashMap<BlockHash, Vec<BlockHash>>,
    /// Pivot-subtree weight: how many blocks sit on pivot paths through this
    /// block (including itself).
    weight: HashMap<BlockHash, u64>,
    /// Period each finalized block was anchored into.
    period_of: HashMap<BlockHash, Period>,
    /// Blocks without children.
    leaves: HashSet<BlockHash>,
    genesis: BlockHash,
    /// Timestamp of the last insertion that grew the max level.
    last_growth_at: u64,
    max_level: Level,
}

/// Authoritative store of all known DAG blocks.
pub struct DagManager {
    inner: RwLock<DagInner>,
}

impl DagManager {
    /// Seed the DAG with its genesis block.
    pub fn new(genesis: DagBlock) -> Self {
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(hash, Arc::new(genesis));
        let mut weight = HashMap::new();
        weight.insert(hash, 1);
        let mut leaves = HashSet::new();
        leaves.insert(hash);
        Self {
            inner: RwLock::new(DagInner {
                blocks,
                children: HashMap::new(),
                weight,
                period_of: HashMap::new(),
                leaves,
                genesis: hash,
                last_growth_at: 0,
                max_level: 0,
            }),
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.inner.read().expect("dag lock").genesis
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.inner.read().expect("dag lock").blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<Arc<DagBlock>> {
        self.inner.read().expect("dag lock").blocks.get(hash).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().expect("dag lock").blocks.len()
    }

    pub fn max_level(&self) -> Level {
        self.inner.read().expect("dag lock").max_level
    }

    /// Whether the tip has stopped growing (drives VDF stale difficulty).
    pub fn is_stale(&self, now: u64, stale_after_secs: u64) -> bool {
        let inner = self.inner.read().expect("dag lock");
        now.saturating_sub(inner.last_growth_at) > stale_after_secs
    }

    /// Validate and insert a block.
    ///
    /// `period_hash` is the finalized-period hash the block's VDF was solved
    /// over; `expected_difficulty` what sortition required of its author.
    pub fn insert(
        &self,
        block: DagBlock,
        period_hash: &H256,
        expected_difficulty: u16,
        now: u64,
    ) -> Result<BlockHash, TrellisError> {
        let hash = block.hash();
        let mut inner = self.inner.write().expect("dag lock");

        if inner.blocks.contains_key(&hash) {
            debug!(block = %hash, "duplicate DAG block ignored");
            return Ok(hash);
        }

        // 1. All parents must already be known.
        for parent in block.parents() {
            if !inner.blocks.contains_key(parent) {
                return Err(TrellisError::MissingParent {
                    block: hash,
                    parent: *parent,
                });
            }
        }

        // 2. Delay gate.
        let challenge = DagBlock::vdf_challenge(block.level, period_hash);
        if !verify_vdf(&challenge, &block.vdf, expected_difficulty) {
            warn!(block = %hash, "VDF verification failed");
            return Err(TrellisError::InvalidVdf(hash));
        }

        // 3. Author signature.
        block.author()?;

        // 4. Level must be exactly one past the highest parent.
        let computed = 1 + block
            .parents()
            .map(|p| inner.blocks[p].level)
            .max()
            .expect("at least the pivot parent");
        if block.level != computed {
            return Err(TrellisError::LevelMismatch {
                block: hash,
                declared: block.level,
                computed,
            });
        }

        // Link in.
        for parent in block.parents() {
            inner.children.entry(*parent).or_default().push(hash);
            inner.leaves.remove(parent);
        }
        inner.leaves.insert(hash);

        // Pivot-subtree weights bump along the pivot ancestry.
        inner.weight.insert(hash, 1);
        let mut cursor = block.pivot;
        loop {
            *inner.weight.entry(cursor).or_insert(0) += 1;
            if cursor == inner.genesis {
                break;
            }
            cursor = inner.blocks[&cursor].pivot;
        }

        if block.level > inner.max_level {
            inner.max_level = block.level;
            inner.last_growth_at = now;
        }
        inner.blocks.insert(hash, Arc::new(block));
        debug!(block = %hash, count = inner.blocks.len(), "DAG block inserted");
        Ok(hash)
    }

    /// Current leaves (blocks with no children), sorted for determinism.
    pub fn tips(&self) -> Vec<BlockHash> {
        let inner = self.inner.read().expect("dag lock");
        let mut tips: Vec<_> = inner.leaves.iter().copied().collect();
        tips.sort();
        tips
    }

    /// The pivot chain from genesis: follow the heaviest child (ties by
    /// lowest hash) until a leaf.
    pub fn pivot_chain(&self) -> Vec<BlockHash> {
        let inner = self.inner.read().expect("dag lock");
        let mut chain = vec![inner.genesis];
        let mut cursor = inner.genesis;
        while let Some(children) = inner.children.get(&cursor) {
            // Only children whose pivot edge points at the cursor compete.
            let mut best: Option<(u64, BlockHash)> = None;
            for child in children {
                if inner.blocks[child].pivot != cursor {
                    continue;
                }
                let w = inner.weight.get(child).copied().unwrap_or(0);
                let better = match best {
                    None => true,
                    Some((bw, bh)) => w > bw || (w == bw && *child < bh),
                };
                if better {
                    best = Some((w, *child));
                }
            }
            match best {
                Some((_, next)) => {
                    chain.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        chain
    }

    /// Pick the anchor for the next period: the pivot tip, walked back while
    /// it exceeds the GHOST cap relative to the previous anchor's level.
    pub fn select_anchor(
        &self,
        prev_anchor: &BlockHash,
        ghost: &GhostConfig,
    ) -> Result<BlockHash, TrellisError> {
        let chain = self.pivot_chain();
        let prev_level = self
            .get(prev_anchor)
            .ok_or(TrellisError::UnknownDagBlock(*prev_anchor))?
            .level;
        let mut idx = chain.len() - 1;
        loop {
            let candidate = chain[idx];
            let level = self.get(&candidate).expect("pivot chain block").level;
            if level.saturating_sub(prev_level) <= ghost.max_ghost_size || idx == 0 {
                return Ok(candidate);
            }
            let back = (ghost.ghost_path_move_back as usize).max(1);
            idx = idx.saturating_sub(back);
        }
    }

    /// All DAG blocks anchored by `anchor` that are not in any prior period,
    /// in canonical order: parents before children, at each block the pivot
    /// ancestry first, then tips in ascending hash order.
    pub fn period_set(&self, anchor: &BlockHash) -> Result<Vec<Arc<DagBlock>>, TrellisError> {
        let inner = self.inner.read().expect("dag lock");
        if !inner.blocks.contains_key(anchor) {
            return Err(TrellisError::UnknownDagBlock(*anchor));
        }

        // Iterative post-order DFS: pivot first, then tips ascending. The
        // post-order emission puts every parent ahead of its children.
        let mut ordered = Vec::new();
        let mut visited: HashSet<BlockHash> = HashSet::new();
        let mut stack: Vec<(BlockHash, bool)> = vec![(*anchor, false)];
        while let Some((hash, expanded)) = stack.pop() {
            if expanded {
                ordered.push(Arc::clone(&inner.blocks[&hash]));
                continue;
            }
            if visited.contains(&hash) || inner.period_of.contains_key(&hash) {
                continue;
            }
            visited.insert(hash);
            stack.push((hash, true));

            let block = &inner.blocks[&hash];
            if block.is_genesis() {
                continue;
            }
            // Pushed in reverse so the pivot is expanded first, then tips in
            // ascending hash order.
            let mut tips = block.tips.clone();
            tips.sort();
            for tip in tips.into_iter().rev() {
                stack.push((tip, false));
            }
            stack.push((block.pivot, false));
        }
        Ok(ordered)
    }

    /// Record that `blocks` were finalized into `period`.
    pub fn assign_period(&self, period: Period, blocks: &[BlockHash]) {
        let mut inner = self.inner.write().expect("dag lock");
        for hash in blocks {
            inner.period_of.insert(*hash, period);
        }
    }

    pub fn period_of(&self, hash: &BlockHash) -> Option<Period> {
        self.inner.read().expect("dag lock").period_of.get(hash).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use trellis_core::types::VrfProof;
    use trellis_crypto::ecdsa::KeyPair;
    use trellis_crypto::vdf::{solve, VdfProof};

    const DIFFICULTY: u16 = 1;

    fn child_of(
        kp: &KeyPair,
        pivot: BlockHash,
        tips: Vec<BlockHash>,
        level: Level,
        ts: u64,
    ) -> DagBlock {
        let challenge = DagBlock::vdf_challenge(level, &H256::zero());
        let vdf = solve(&challenge, DIFFICULTY, &AtomicBool::new(false)).unwrap();
        let mut block = DagBlock::new(pivot, tips, level, ts, vdf, VrfProof::default(), vec![]);
        block.sign(kp);
        block
    }

    fn insert(dag: &DagManager, block: DagBlock) -> BlockHash {
        dag.insert(block, &H256::zero(), DIFFICULTY, 100).unwrap()
    }

    #[test]
    fn missing_parent_rejected() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let orphan = child_of(&kp, H256::repeat_byte(0xEE), vec![], 1, 100);
        assert!(matches!(
            dag.insert(orphan, &H256::zero(), DIFFICULTY, 100),
            Err(TrellisError::MissingParent { .. })
        ));
    }

    #[test]
    fn wrong_level_rejected() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let wrong = child_of(&kp, dag.genesis_hash(), vec![], 5, 100);
        assert!(matches!(
            dag.insert(wrong, &H256::zero(), DIFFICULTY, 100),
            Err(TrellisError::LevelMismatch { .. })
        ));
    }

    #[test]
    fn bad_vdf_rejected() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let mut block = DagBlock::new(
            dag.genesis_hash(),
            vec![],
            1,
            100,
            VdfProof {
                difficulty: 30,
                nonce: 0,
            },
            VrfProof::default(),
            vec![],
        );
        block.sign(&kp);
        let result = dag.insert(block, &H256::zero(), 30, 100);
        assert!(matches!(result, Err(TrellisError::InvalidVdf(_))));
    }

    #[test]
    fn unsigned_block_rejected() {
        let dag = DagManager::new(DagBlock::genesis());
        let challenge = DagBlock::vdf_challenge(1, &H256::zero());
        let vdf = solve(&challenge, DIFFICULTY, &AtomicBool::new(false)).unwrap();
        let block = DagBlock::new(
            dag.genesis_hash(),
            vec![],
            1,
            100,
            vdf,
            VrfProof::default(),
            vec![],
        );
        assert!(dag.insert(block, &H256::zero(), DIFFICULTY, 100).is_err());
    }

    #[test]
    fn level_strictly_increases_along_chain() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let mut prev = dag.genesis_hash();
        for level in 1..=5 {
            prev = insert(&dag, child_of(&kp, prev, vec![], level, 100 + level));
            assert_eq!(dag.get(&prev).unwrap().level, level);
        }
        assert_eq!(dag.max_level(), 5);
    }

    #[test]
    fn pivot_follows_heaviest_child() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let genesis = dag.genesis_hash();
        let a = insert(&dag, child_of(&kp, genesis, vec![], 1, 101));
        let b = insert(&dag, child_of(&kp, genesis, vec![], 1, 102));
        // Grow a two-block chain under `a`; `b` stays a leaf.
        let a2 = insert(&dag, child_of(&kp, a, vec![], 2, 103));
        let chain = dag.pivot_chain();
        assert_eq!(chain, vec![genesis, a, a2]);
        assert!(dag.tips().contains(&b));
    }

    #[test]
    fn diamond_period_order_is_deterministic() {
        // G ← {X, Y} ← Z with X.hash < Y.hash: canonical order [G, X, Y, Z].
        let kp = KeyPair::generate();
        let dag = DagManager::new(DagBlock::genesis());
        let genesis = dag.genesis_hash();
        let mut first = child_of(&kp, genesis, vec![], 1, 101);
        let mut second = child_of(&kp, genesis, vec![], 1, 102);
        if first.hash() > second.hash() {
            std::mem::swap(&mut first, &mut second);
        }
        let x = first.hash();
        let y = second.hash();
        let z_block = child_of(&kp, x, vec![y], 2, 103);
        let z = z_block.hash();

        // Insert in scrambled order relative to the canonical result.
        insert(&dag, second);
        insert(&dag, first);
        insert(&dag, z_block);

        let set = dag.period_set(&z).unwrap();
        let hashes: Vec<_> = set.iter().map(|b| b.hash()).collect();
        assert_eq!(hashes, vec![genesis, x, y, z]);
    }

    #[test]
    fn period_sets_are_disjoint() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let genesis = dag.genesis_hash();
        let a = insert(&dag, child_of(&kp, genesis, vec![], 1, 101));
        let first = dag.period_set(&a).unwrap();
        let first_hashes: Vec<_> = first.iter().map(|b| b.hash()).collect();
        dag.assign_period(1, &first_hashes);

        let b = insert(&dag, child_of(&kp, a, vec![], 2, 102));
        let second = dag.period_set(&b).unwrap();
        let second_hashes: Vec<_> = second.iter().map(|blk| blk.hash()).collect();
        assert_eq!(second_hashes, vec![b]);
        for h in &second_hashes {
            assert!(!first_hashes.contains(h));
        }
    }

    #[test]
    fn ghost_cap_walks_anchor_back() {
        let dag = DagManager::new(DagBlock::genesis());
        let kp = KeyPair::generate();
        let genesis = dag.genesis_hash();
        let mut prev = genesis;
        for level in 1..=6 {
            prev = insert(&dag, child_of(&kp, prev, vec![], level, 100 + level));
        }
        let ghost = GhostConfig {
            max_ghost_size: 3,
            ghost_path_move_back: 1,
        };
        let anchor = dag.select_anchor(&genesis, &ghost).unwrap();
        let anchor_level = dag.get(&anchor).unwrap().level;
        assert!(anchor_level <= 3);

        // A permissive cap takes the tip directly.
        let wide = GhostConfig {
            max_ghost_size: 100,
            ghost_path_move_back: 1,
        };
        assert_eq!(dag.select_anchor(&genesis, &wide).unwrap(), prev);
    }
}
