//! Deterministic block-reward distribution.
//!
//! For a finalized period p the reward splits three ways: the PBFT proposer,
//! the voters whose cert-votes on block p−1 rode into block p's reward
//! bundle (weight-proportional), and the authors of period-p DAG blocks that
//! contributed at least one unique transaction. Transaction fees go to the
//! DAG author that first included each transaction. All division is floor
//! division; the dust lands on the proposer.

use std::collections::BTreeMap;

use trellis_core::types::{Address, Period, U256};

#[derive(Clone, Copy, Debug)]
pub struct RewardsConfig {
    /// Fresh issuance per finalized period.
    pub block_reward: U256,
    /// Percent splits; must sum to 100.
    pub proposer_percent: u64,
    pub voters_percent: u64,
    pub dag_authors_percent: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            block_reward: U256::from(2_000_000_000u64),
            proposer_percent: 20,
            voters_percent: 40,
            dag_authors_percent: 40,
        }
    }
}

/// Everything the split depends on, already reduced to plain data.
#[derive(Clone, Debug, Default)]
pub struct RewardsInput {
    pub period: Period,
    pub proposer: Address,
    /// (voter, cert-vote weight) pairs from the reward-votes bundle.
    pub cert_voters: Vec<(Address, u64)>,
    /// Authors of DAG blocks that contributed ≥ 1 unique transaction.
    pub eligible_dag_authors: Vec<Address>,
    /// (first-including author, fee) per executed transaction.
    pub tx_fees: Vec<(Address, U256)>,
}

/// Compute the final per-address credit for one period. The result's
/// BTreeMap ordering is the deterministic address-order tie-break.
pub fn distribute_rewards(config: &RewardsConfig, input: &RewardsInput) -> BTreeMap<Address, U256> {
    debug_assert_eq!(
        config.proposer_percent + config.voters_percent + config.dag_authors_percent,
        100
    );
    let mut credits: BTreeMap<Address, U256> = BTreeMap::new();
    let mut credit = |addr: Address, amount: U256| {
        if !amount.is_zero() {
            *credits.entry(addr).or_insert_with(U256::zero) += amount;
        }
    };

    let reward = config.block_reward;
    let proposer_share = reward * U256::from(config.proposer_percent) / U256::from(100u64);
    let voters_share = reward * U256::from(config.voters_percent) / U256::from(100u64);
    let authors_share = reward * U256::from(config.dag_authors_percent) / U256::from(100u64);
    let mut dust = reward - proposer_share - voters_share - authors_share;

    // Voters, weight-proportional.
    let total_weight: u64 = input.cert_voters.iter().map(|(_, w)| *w).sum();
    if total_weight > 0 {
        let mut paid = U256::zero();
        for (voter, weight) in &input.cert_voters {
            let cut = voters_share * U256::from(*weight) / U256::from(total_weight);
            paid += cut;
            credit(*voter, cut);
        }
        dust += voters_share - paid;
    } else {
        dust += voters_share;
    }

    // DAG authors with ≥ 1 unique transaction; zero-unique authors were
    // filtered out upstream and earn nothing.
    if !input.eligible_dag_authors.is_empty() {
        let n = U256::from(input.eligible_dag_authors.len() as u64);
        let per_author = authors_share / n;
        let mut paid = U256::zero();
        for author in &input.eligible_dag_authors {
            paid += per_author;
            credit(*author, per_author);
        }
        dust += authors_share - paid;
    } else {
        dust += authors_share;
    }

    // Fees follow first inclusion.
    for (author, fee) in &input.tx_fees {
        credit(*author, *fee);
    }

    credit(input.proposer, proposer_share + dust);
    credits
}
