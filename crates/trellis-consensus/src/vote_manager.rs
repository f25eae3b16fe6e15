//! Vote verification, deduplication and weight accounting.
//!
//! Votes are bucketed by (period, round); each bucket is an independently
//! locked shard so vote floods on one round do not serialize the others.
//! A vote is counted once: duplicates are dropped on their vote hash, and a
//! voter producing two different targets at the same (period, round, step)
//! is flagged slashable with both votes kept as evidence (only the first
//! contributes weight).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use trellis_core::constants::FIRST_NEXT_STEP;
use trellis_core::error::TrellisError;
use trellis_core::types::{Address, BlockHash, Period, Round, Step, VoteWeight, H256};
use trellis_crypto::vrf::verify_vrf;

use crate::config::{CommitteeConfig, StakeView};
use crate::sortition::sortition_weight;
use crate::vote::{NextVotesBundle, Vote};

/// Outcome of [`VoteManager::add`].
#[derive(Debug)]
pub enum AddVoteResult {
    Added { weight: VoteWeight },
    Duplicate,
    Equivocation,
    Invalid(TrellisError),
}

impl AddVoteResult {
    pub fn is_added(&self) -> bool {
        matches!(self, AddVoteResult::Added { .. })
    }
}

/// A vote that passed signature, VRF and stake checks.
#[derive(Clone, Debug)]
pub struct VerifiedVote {
    pub vote: Arc<Vote>,
    pub voter: Address,
    pub weight: VoteWeight,
}

/// Both votes of a detected equivocation, kept for slashing.
#[derive(Clone, Debug)]
pub struct EquivocationEvidence {
    pub voter: Address,
    pub first: Arc<Vote>,
    pub second: Arc<Vote>,
}

#[derive(Default)]
struct Shard {
    votes: HashMap<H256, VerifiedVote>,
    tally: HashMap<(Step, BlockHash), VoteWeight>,
    by_step_value: HashMap<(Step, BlockHash), Vec<H256>>,
    voter_choice: HashMap<(Step, Address), (BlockHash, H256)>,
    equivocators: HashSet<Address>,
}

pub struct VoteManager {
    committee: CommitteeConfig,
    stake_view: Arc<dyn StakeView>,
    shards: RwLock<HashMap<(Period, Round), Arc<Mutex<Shard>>>>,
    evidence: Mutex<Vec<EquivocationEvidence>>,
}

impl VoteManager {
    pub fn new(committee: CommitteeConfig, stake_view: Arc<dyn StakeView>) -> Self {
        Self {
            committee,
            stake_view,
            shards: RwLock::new(HashMap::new()),
            evidence: Mutex::new(Vec::new()),
        }
    }

    pub fn committee(&self) -> &CommitteeConfig {
        &self.committee
    }

    pub fn stake_view(&self) -> &Arc<dyn StakeView> {
        &self.stake_view
    }

    fn shard(&self, period: Period, round: Round) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self
            .shards
            .read()
            .expect("vote shards lock")
            .get(&(period, round))
        {
            return Arc::clone(shard);
        }
        let mut shards = self.shards.write().expect("vote shards lock");
        Arc::clone(shards.entry((period, round)).or_default())
    }

    /// Verify and record a vote. `period_hash` is the finalized hash the
    /// vote's VRF credential must bind to.
    pub fn add(&self, vote: Vote, period_hash: &H256) -> AddVoteResult {
        let vote_hash = vote.vote_hash();
        let sortition = vote.sortition;
        let shard = self.shard(sortition.period, sortition.round);
        {
            let guard = shard.lock().expect("vote shard lock");
            if guard.votes.contains_key(&vote_hash) {
                return AddVoteResult::Duplicate;
            }
        }

        // Verification happens outside the shard lock: recovery and VRF are
        // the expensive part and must not serialize other rounds' intake.
        let voter = match vote.voter() {
            Ok(addr) => addr,
            Err(e) => return AddVoteResult::Invalid(e),
        };
        let snapshot_period = sortition
            .period
            .saturating_sub(self.committee.delegation_delay);
        let Some(table) = self.stake_view.snapshot_at(snapshot_period) else {
            return AddVoteResult::Invalid(TrellisError::NoStake(snapshot_period));
        };
        let Some(entry) = table.get(&voter) else {
            return AddVoteResult::Invalid(TrellisError::NoStake(snapshot_period));
        };
        let output = match verify_vrf(
            &entry.vrf_key,
            &sortition.proof,
            &sortition.message(period_hash),
        ) {
            Ok(output) => output,
            Err(e) => return AddVoteResult::Invalid(e),
        };
        let weight = sortition_weight(
            &output,
            entry.stake,
            table.total_stake(),
            self.committee.expected_weight(sortition.step),
        );
        if weight == 0 {
            return AddVoteResult::Invalid(TrellisError::ZeroWeight);
        }

        let vote = Arc::new(vote);
        let mut guard = shard.lock().expect("vote shard lock");
        if guard.votes.contains_key(&vote_hash) {
            return AddVoteResult::Duplicate;
        }

        let choice_key = (sortition.step, voter);
        if let Some((prior_value, prior_hash)) = guard.voter_choice.get(&choice_key).copied() {
            if prior_value != vote.block_hash {
                warn!(
                    voter = %voter,
                    period = sortition.period,
                    round = sortition.round,
                    step = sortition.step,
                    "equivocating vote detected"
                );
                guard.equivocators.insert(voter);
                let first = Arc::clone(&guard.votes[&prior_hash].vote);
                // Keep the second vote as evidence without counting it.
                guard.votes.insert(
                    vote_hash,
                    VerifiedVote {
                        vote: Arc::clone(&vote),
                        voter,
                        weight: 0,
                    },
                );
                self.evidence
                    .lock()
                    .expect("evidence lock")
                    .push(EquivocationEvidence {
                        voter,
                        first,
                        second: vote,
                    });
                return AddVoteResult::Equivocation;
            }
        } else {
            guard.voter_choice.insert(choice_key, (vote.block_hash, vote_hash));
        }

        let value_key = (sortition.step, vote.block_hash);
        *guard.tally.entry(value_key).or_insert(0) += weight;
        guard.by_step_value.entry(value_key).or_default().push(vote_hash);
        guard.votes.insert(
            vote_hash,
            VerifiedVote {
                vote,
                voter,
                weight,
            },
        );
        debug!(
            period = sortition.period,
            round = sortition.round,
            step = sortition.step,
            weight,
            "vote added"
        );
        AddVoteResult::Added { weight }
    }

    /// Validated weight behind (period, round, step, voted hash).
    pub fn weight(
        &self,
        period: Period,
        round: Round,
        step: Step,
        voted: &BlockHash,
    ) -> VoteWeight {
        let shard = self.shard(period, round);
        let guard = shard.lock().expect("vote shard lock");
        guard.tally.get(&(step, *voted)).copied().unwrap_or(0)
    }

    pub fn has_two_t_plus_one(
        &self,
        period: Period,
        round: Round,
        step: Step,
        voted: &BlockHash,
    ) -> bool {
        self.weight(period, round, step, voted) >= self.committee.two_t_plus_one(step)
    }

    /// All verified votes behind (period, round, step, voted hash).
    pub fn votes_for(
        &self,
        period: Period,
        round: Round,
        step: Step,
        voted: &BlockHash,
    ) -> Vec<Arc<Vote>> {
        let shard = self.shard(period, round);
        let guard = shard.lock().expect("vote shard lock");
        guard
            .by_step_value
            .get(&(step, *voted))
            .map(|hashes| {
                hashes
                    .iter()
                    .map(|h| Arc::clone(&guard.votes[h].vote))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Values that reached 2f+1 at `step`, if any (at most one honest value;
    /// the null sentinel competes like any other).
    pub fn winner_at(
        &self,
        period: Period,
        round: Round,
        step: Step,
    ) -> Option<(BlockHash, VoteWeight)> {
        let threshold = self.committee.two_t_plus_one(step);
        let shard = self.shard(period, round);
        let guard = shard.lock().expect("vote shard lock");
        guard
            .tally
            .iter()
            .filter(|((s, _), w)| *s == step && **w >= threshold)
            .map(|((_, value), w)| (*value, *w))
            .max_by_key(|(value, w)| (*w, std::cmp::Reverse(*value)))
    }

    /// The 2f+1 next-votes bundle for a round, taken from the highest
    /// next-step that converged on a single value.
    pub fn next_votes_bundle(&self, period: Period, round: Round) -> Option<NextVotesBundle> {
        let shard = self.shard(period, round);
        let guard = shard.lock().expect("vote shard lock");
        let mut best: Option<(Step, BlockHash)> = None;
        for ((step, value), weight) in &guard.tally {
            if *step < FIRST_NEXT_STEP || *weight < self.committee.two_t_plus_one(*step) {
                continue;
            }
            let better = match best {
                None => true,
                Some((bs, _)) => *step > bs,
            };
            if better {
                best = Some((*step, *value));
            }
        }
        let (step, value) = best?;
        let votes = guard.by_step_value[&(step, value)]
            .iter()
            .map(|h| guard.votes[h].vote.as_ref().clone())
            .collect();
        Some(NextVotesBundle {
            period,
            round,
            voted_value: value,
            votes,
        })
    }

    /// Verify a peer-supplied bundle: every vote must be a next-vote of the
    /// bundle's (period, round) for the bundle's value, individually valid,
    /// and their weights must reach 2f+1.
    pub fn verify_bundle(
        &self,
        bundle: &NextVotesBundle,
        period_hash: &H256,
    ) -> Result<(), TrellisError> {
        let mut total: VoteWeight = 0;
        let mut seen: HashSet<H256> = HashSet::new();
        for vote in &bundle.votes {
            let sortition = vote.sortition;
            if sortition.period != bundle.period
                || sortition.round != bundle.round
                || sortition.step < FIRST_NEXT_STEP
                || vote.block_hash != bundle.voted_value
            {
                return Err(TrellisError::MalformedEncoding(
                    "bundle vote outside its (period, round, step) scope".into(),
                ));
            }
            if !seen.insert(vote.vote_hash()) {
                continue;
            }
            let voter = vote.voter()?;
            let snapshot_period = sortition
                .period
                .saturating_sub(self.committee.delegation_delay);
            let table = self
                .stake_view
                .snapshot_at(snapshot_period)
                .ok_or(TrellisError::NoStake(snapshot_period))?;
            let entry = table
                .get(&voter)
                .ok_or(TrellisError::NoStake(snapshot_period))?;
            let output = verify_vrf(
                &entry.vrf_key,
                &sortition.proof,
                &sortition.message(period_hash),
            )?;
            total += sortition_weight(
                &output,
                entry.stake,
                table.total_stake(),
                self.committee.expected_weight(sortition.step),
            );
        }
        // Next-steps share the soft threshold.
        if total < self.committee.two_t_plus_one(FIRST_NEXT_STEP) {
            return Err(TrellisError::MissingNextVotesBundle {
                period: bundle.period,
                round: bundle.round,
            });
        }
        Ok(())
    }

    pub fn is_slashable(&self, period: Period, round: Round, voter: &Address) -> bool {
        let shard = self.shard(period, round);
        let guard = shard.lock().expect("vote shard lock");
        guard.equivocators.contains(voter)
    }

    /// Drain accumulated equivocation evidence for reporting upward.
    pub fn take_equivocation_evidence(&self) -> Vec<EquivocationEvidence> {
        std::mem::take(&mut *self.evidence.lock().expect("evidence lock"))
    }

    /// Drop shards from already-finalized periods.
    pub fn prune_below(&self, period: Period) {
        self.shards
            .write()
            .expect("vote shards lock")
            .retain(|(p, _), _| *p >= period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StakeEntry, StakeTable, StaticStakeView};
    use trellis_core::types::NULL_BLOCK_HASH;
    use trellis_crypto::ecdsa::KeyPair;
    use trellis_crypto::vrf::VrfKeyPair;

    struct Voter {
        kp: KeyPair,
        vrf: VrfKeyPair,
    }

    fn committee() -> CommitteeConfig {
        // Three voters of stake 3 each; τ = 9 forces p = 1 so each vote
        // carries its full stake. 2f+1 = 7: two voters are not enough.
        CommitteeConfig {
            soft_committee: 9,
            cert_committee: 9,
            delegation_delay: 0,
        }
    }

    fn setup(n: u8) -> (VoteManager, Vec<Voter>) {
        let voters: Vec<Voter> = (0..n)
            .map(|i| Voter {
                kp: KeyPair::generate(),
                vrf: VrfKeyPair::from_seed(&[i + 1; 32]),
            })
            .collect();
        let table = StakeTable::new(voters.iter().map(|v| {
            (
                v.kp.address,
                StakeEntry {
                    stake: 3,
                    vrf_key: v.vrf.public_key(),
                },
            )
        }));
        let manager = VoteManager::new(committee(), Arc::new(StaticStakeView::new(table)));
        (manager, voters)
    }

    fn cast(manager: &VoteManager, voter: &Voter, value: BlockHash, step: Step) -> AddVoteResult {
        let vote = Vote::signed(value, 1, 1, step, &H256::zero(), &voter.vrf, &voter.kp);
        manager.add(vote, &H256::zero())
    }

    #[test]
    fn votes_accumulate_to_threshold() {
        let (manager, voters) = setup(3);
        let value = H256::repeat_byte(0xAA);

        assert!(cast(&manager, &voters[0], value, 3).is_added());
        assert!(!manager.has_two_t_plus_one(1, 1, 3, &value));
        assert!(cast(&manager, &voters[1], value, 3).is_added());
        assert!(!manager.has_two_t_plus_one(1, 1, 3, &value));
        assert!(cast(&manager, &voters[2], value, 3).is_added());
        assert!(manager.has_two_t_plus_one(1, 1, 3, &value));
        assert_eq!(manager.weight(1, 1, 3, &value), 9);
        assert_eq!(manager.votes_for(1, 1, 3, &value).len(), 3);
    }

    #[test]
    fn duplicate_vote_not_double_counted() {
        let (manager, voters) = setup(1);
        let value = H256::repeat_byte(1);
        let vote = Vote::signed(value, 1, 1, 3, &H256::zero(), &voters[0].vrf, &voters[0].kp);
        assert!(manager.add(vote.clone(), &H256::zero()).is_added());
        assert!(matches!(
            manager.add(vote, &H256::zero()),
            AddVoteResult::Duplicate
        ));
        assert_eq!(manager.weight(1, 1, 3, &value), 3);
    }

    #[test]
    fn equivocation_detected_and_kept_as_evidence() {
        let (manager, voters) = setup(1);
        let first = cast(&manager, &voters[0], H256::repeat_byte(1), 3);
        assert!(first.is_added());
        let second = cast(&manager, &voters[0], H256::repeat_byte(2), 3);
        assert!(matches!(second, AddVoteResult::Equivocation));
        assert!(manager.is_slashable(1, 1, &voters[0].kp.address));

        // First vote keeps its weight; the second contributes nothing.
        assert_eq!(manager.weight(1, 1, 3, &H256::repeat_byte(1)), 3);
        assert_eq!(manager.weight(1, 1, 3, &H256::repeat_byte(2)), 0);

        let evidence = manager.take_equivocation_evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].voter, voters[0].kp.address);
        assert_ne!(evidence[0].first.block_hash, evidence[0].second.block_hash);
    }

    #[test]
    fn unknown_voter_rejected() {
        let (manager, _) = setup(1);
        let outsider = Voter {
            kp: KeyPair::generate(),
            vrf: VrfKeyPair::from_seed(&[99u8; 32]),
        };
        assert!(matches!(
            cast(&manager, &outsider, H256::repeat_byte(1), 3),
            AddVoteResult::Invalid(TrellisError::NoStake(_))
        ));
    }

    #[test]
    fn next_votes_bundle_requires_threshold() {
        let (manager, voters) = setup(3);
        assert!(manager.next_votes_bundle(1, 1).is_none());
        for voter in &voters {
            assert!(cast(&manager, voter, NULL_BLOCK_HASH, 4).is_added());
        }
        let bundle = manager.next_votes_bundle(1, 1).expect("bundle");
        assert_eq!(bundle.voted_value, NULL_BLOCK_HASH);
        assert_eq!(bundle.votes.len(), 3);
        manager.verify_bundle(&bundle, &H256::zero()).unwrap();
    }

    #[test]
    fn tampered_bundle_rejected() {
        let (manager, voters) = setup(3);
        for voter in &voters {
            assert!(cast(&manager, voter, NULL_BLOCK_HASH, 4).is_added());
        }
        let mut bundle = manager.next_votes_bundle(1, 1).unwrap();
        bundle.votes.truncate(2);
        assert!(manager.verify_bundle(&bundle, &H256::zero()).is_err());
        let mut wrong_value = manager.next_votes_bundle(1, 1).unwrap();
        wrong_value.voted_value = H256::repeat_byte(7);
        assert!(manager.verify_bundle(&wrong_value, &H256::zero()).is_err());
    }
}
