use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_core::constants::{
    DEFAULT_CERT_COMMITTEE, DEFAULT_DELEGATION_DELAY, DEFAULT_LAMBDA_MS, DEFAULT_SOFT_COMMITTEE,
    CERT_STEP, STEP_EXPONENT_CAP,
};
use trellis_core::types::{Address, Period, Step, VoteWeight, VrfPublicKey};
use trellis_dag::manager::GhostConfig;

/// Committee sizing and the stake-snapshot delay.
#[derive(Clone, Copy, Debug)]
pub struct CommitteeConfig {
    /// Expected committee weight for soft/next steps.
    pub soft_committee: VoteWeight,
    /// Expected committee weight for the cert step.
    pub cert_committee: VoteWeight,
    /// Vote validation reads stakes at `period - delegation_delay`.
    pub delegation_delay: u64,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            soft_committee: DEFAULT_SOFT_COMMITTEE,
            cert_committee: DEFAULT_CERT_COMMITTEE,
            delegation_delay: DEFAULT_DELEGATION_DELAY,
        }
    }
}

impl CommitteeConfig {
    /// Sortition threshold τ for a step (cert is larger than soft).
    pub fn expected_weight(&self, step: Step) -> VoteWeight {
        if step == CERT_STEP {
            self.cert_committee
        } else {
            self.soft_committee
        }
    }

    /// Supermajority weight gate: with up to f byzantine weight out of
    /// 3f + 1, agreement needs 2f + 1.
    pub fn two_t_plus_one(&self, step: Step) -> VoteWeight {
        let committee = self.expected_weight(step);
        2 * committee / 3 + 1
    }
}

/// Full PBFT engine configuration.
#[derive(Clone, Debug)]
pub struct PbftConfig {
    pub chain_id: u64,
    /// Base step-timing parameter λ, milliseconds.
    pub lambda_ms: u64,
    /// Cap on the step-timeout exponent.
    pub exponent_cap: u32,
    pub committee: CommitteeConfig,
    pub ghost: GhostConfig,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            lambda_ms: DEFAULT_LAMBDA_MS,
            exponent_cap: STEP_EXPONENT_CAP,
            committee: CommitteeConfig::default(),
            ghost: GhostConfig::default(),
        }
    }
}

impl PbftConfig {
    /// Nominal timeout for `step`: λ·2^min(s−1, cap).
    pub fn step_timeout_ms(&self, step: Step) -> u64 {
        let exp = (step.saturating_sub(1)).min(self.exponent_cap);
        self.lambda_ms << exp
    }
}

// ── Stake snapshots ──────────────────────────────────────────────────────────

/// One eligible voter in a snapshot.
#[derive(Clone, Debug)]
pub struct StakeEntry {
    pub stake: VoteWeight,
    pub vrf_key: VrfPublicKey,
}

/// The DPOS stake table at one period. Iteration order is address order
/// (deterministic).
#[derive(Clone, Debug, Default)]
pub struct StakeTable {
    entries: BTreeMap<Address, StakeEntry>,
    total: VoteWeight,
}

impl StakeTable {
    pub fn new(entries: impl IntoIterator<Item = (Address, StakeEntry)>) -> Self {
        let entries: BTreeMap<_, _> = entries.into_iter().collect();
        let total = entries.values().map(|e| e.stake).sum();
        Self { entries, total }
    }

    pub fn get(&self, addr: &Address) -> Option<&StakeEntry> {
        self.entries.get(addr)
    }

    pub fn stake_of(&self, addr: &Address) -> VoteWeight {
        self.entries.get(addr).map(|e| e.stake).unwrap_or(0)
    }

    pub fn total_stake(&self) -> VoteWeight {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &StakeEntry)> {
        self.entries.iter()
    }
}

/// Where vote validation finds the stake table for a period. The delegation
/// delay is applied by the caller; implementations answer for the exact
/// period asked.
pub trait StakeView: Send + Sync {
    fn snapshot_at(&self, period: Period) -> Option<Arc<StakeTable>>;
}

/// A fixed stake table for every period — what a fresh chain runs on until
/// delegation changes are executed.
pub struct StaticStakeView {
    table: Arc<StakeTable>,
}

impl StaticStakeView {
    pub fn new(table: StakeTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }
}

impl StakeView for StaticStakeView {
    fn snapshot_at(&self, _period: Period) -> Option<Arc<StakeTable>> {
        Some(Arc::clone(&self.table))
    }
}
