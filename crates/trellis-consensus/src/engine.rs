//! The PBFT round/step state machine.
//!
//! One engine instance drives one node through periods. Within a period it
//! loops rounds of propose → soft → cert → next… steps; step timeouts follow
//! λ·2^min(s−1, cap) with a small address-derived jitter so proposers do not
//! fire in lockstep. The engine owns no network and no storage: votes and
//! proposal bodies arrive on channels, decisions leave as
//! [`ConsensusEvent`]s through an outbox the async shell flushes after every
//! transition.
//!
//! Safety: once this node cert-votes a value it stays locked on it until a
//! 2f+1 next-vote set from a later round shows a different value (or null).
//! Liveness: every step has a timeout, and a round with no convergence
//! degrades to null next-votes, which still form a round-change bundle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trellis_core::constants::{CERT_STEP, FIRST_NEXT_STEP, PROPOSE_STEP, SOFT_STEP};
use trellis_core::error::TrellisError;
use trellis_core::types::{
    Address, BlockHash, Period, Round, Step, TxHash, VoteWeight, VrfOutput, H256, NULL_BLOCK_HASH,
};
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vrf::{proof_to_output, VrfKeyPair};
use trellis_dag::manager::DagManager;

use crate::config::{PbftConfig, StakeTable};
use crate::pbft_block::PbftBlock;
use crate::sortition::sortition_weight;
use crate::vote::{NextVotesBundle, Vote, VrfSortition};
use crate::vote_manager::{AddVoteResult, VoteManager};

/// What the engine tells the outside world.
#[derive(Debug)]
pub enum ConsensusEvent {
    BroadcastVote(Vote),
    BroadcastBlock(PbftBlock),
    Finalized(FinalizedPeriod),
}

/// Emitted once per period when 2f+1 cert weight lands on one value.
#[derive(Debug, Clone)]
pub struct FinalizedPeriod {
    pub period: Period,
    pub block: PbftBlock,
    pub cert_votes: Vec<Arc<Vote>>,
}

/// Where the engine starts from (genesis or a synced head).
#[derive(Debug, Clone, Copy)]
pub struct ChainHead {
    /// The period currently being decided.
    pub period: Period,
    /// Hash of the PBFT block at `period − 1` (null at genesis).
    pub prev_block_hash: BlockHash,
    /// DAG anchor of the last finalized period (the DAG genesis at start).
    pub prev_anchor: BlockHash,
}

pub struct PbftEngine {
    config: PbftConfig,
    key: Arc<KeyPair>,
    vrf_key: Arc<VrfKeyPair>,
    votes: Arc<VoteManager>,
    dag: Arc<DagManager>,
    outbox: Vec<ConsensusEvent>,

    // Chain head.
    period: Period,
    prev_block_hash: BlockHash,
    prev_anchor: BlockHash,

    // Round state.
    round: Round,
    step: Step,
    locked_value: Option<BlockHash>,
    /// Proposal bodies known this period, by hash.
    proposal_bodies: HashMap<BlockHash, PbftBlock>,
    /// Propose-votes seen this round with their VRF outputs (lowest wins).
    proposals: HashMap<BlockHash, VrfOutput>,
    soft_voted: Option<BlockHash>,
    cert_voted: bool,
    /// Value with 2f+1 cert weight whose body has not arrived yet.
    pending_finalize: Option<BlockHash>,
    /// Bundle that justified entering the current round.
    carry_bundle: Option<NextVotesBundle>,

    step_deadline: Instant,
}

impl PbftEngine {
    pub fn new(
        config: PbftConfig,
        key: Arc<KeyPair>,
        vrf_key: Arc<VrfKeyPair>,
        votes: Arc<VoteManager>,
        dag: Arc<DagManager>,
        head: ChainHead,
    ) -> Self {
        let mut engine = Self {
            config,
            key,
            vrf_key,
            votes,
            dag,
            outbox: Vec::new(),
            period: head.period,
            prev_block_hash: head.prev_block_hash,
            prev_anchor: head.prev_anchor,
            round: 1,
            step: PROPOSE_STEP,
            locked_value: None,
            proposal_bodies: HashMap::new(),
            proposals: HashMap::new(),
            soft_voted: None,
            cert_voted: false,
            pending_finalize: None,
            carry_bundle: None,
            step_deadline: Instant::now(),
        };
        engine.step_deadline = Instant::now() + engine.step_duration();
        engine
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn address(&self) -> Address {
        self.key.address
    }

    /// The finalized hash VRF credentials for the current period bind to.
    fn period_hash(&self) -> H256 {
        self.prev_block_hash
    }

    fn step_duration(&self) -> Duration {
        let base = self.config.step_timeout_ms(self.step);
        // Address-derived jitter breaks proposer ties between nodes with
        // identical timeouts.
        let jitter = u64::from(self.key.address.as_bytes()[0]) % (self.config.lambda_ms / 8 + 1);
        Duration::from_millis(base + jitter)
    }

    /// Kick off the first propose step. Called once before the event loop.
    pub fn start(&mut self) {
        self.enter_step(PROPOSE_STEP);
    }

    /// Drive the engine until shutdown. Votes and proposal bodies arrive on
    /// their channels; timeouts come from the step clock.
    pub async fn run(
        mut self,
        events: mpsc::Sender<ConsensusEvent>,
        mut votes_rx: mpsc::Receiver<Vote>,
        mut blocks_rx: mpsc::Receiver<PbftBlock>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(period = self.period, "PBFT engine started");
        self.start();
        self.flush(&events).await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(self.step_deadline) => {
                    self.on_step_timeout();
                }
                maybe_vote = votes_rx.recv() => {
                    match maybe_vote {
                        Some(vote) => self.handle_vote(vote),
                        None => break,
                    }
                }
                maybe_block = blocks_rx.recv() => {
                    match maybe_block {
                        Some(block) => self.handle_proposal(block),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.flush(&events).await;
        }
        info!(period = self.period, "PBFT engine stopped");
    }

    /// Ship everything the last transition produced.
    pub async fn flush(&mut self, events: &mpsc::Sender<ConsensusEvent>) {
        for event in self.outbox.drain(..) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    /// Drain the outbox synchronously (test harnesses).
    pub fn take_events(&mut self) -> Vec<ConsensusEvent> {
        std::mem::take(&mut self.outbox)
    }

    // ── Inbound handlers ─────────────────────────────────────────────────────

    /// Feed one vote through validation into the tally, then re-evaluate
    /// thresholds.
    pub fn handle_vote(&mut self, vote: Vote) {
        if vote.sortition.period != self.period {
            debug!(
                got = vote.sortition.period,
                current = self.period,
                "vote outside current period ignored"
            );
            return;
        }
        let sortition = vote.sortition;
        let block_hash = vote.block_hash;
        match self.votes.add(vote, &self.period_hash()) {
            AddVoteResult::Added { .. } => {
                if sortition.step == PROPOSE_STEP && sortition.round == self.round {
                    if let Ok(output) = proof_to_output(&sortition.proof) {
                        self.proposals.entry(block_hash).or_insert(output);
                    }
                }
                self.poll_progress();
            }
            AddVoteResult::Duplicate => {}
            AddVoteResult::Equivocation => {
                warn!(period = self.period, "equivocation recorded");
            }
            AddVoteResult::Invalid(e) => {
                debug!(error = %e, "invalid vote dropped");
            }
        }
    }

    /// A proposal body arrived (own proposal or gossip).
    pub fn handle_proposal(&mut self, block: PbftBlock) {
        if block.period != self.period {
            return;
        }
        if block.author().is_err() {
            warn!("proposal with unrecoverable signature dropped");
            return;
        }
        let hash = block.hash();
        self.proposal_bodies.entry(hash).or_insert(block);
        if self.pending_finalize == Some(hash) {
            self.finalize(hash);
        }
    }

    // ── Step clock ───────────────────────────────────────────────────────────

    /// The current step's window elapsed.
    pub fn on_step_timeout(&mut self) {
        match self.step {
            s if s == PROPOSE_STEP => {
                // Own proposal went out on step entry; move on to filtering.
                self.enter_step(SOFT_STEP);
            }
            s if s == SOFT_STEP => {
                self.cast_soft_vote();
                self.enter_step(CERT_STEP);
            }
            s if s == CERT_STEP => {
                // Whether or not we cert-voted, the window is over.
                self.enter_step(FIRST_NEXT_STEP);
            }
            _ => {
                self.cast_next_vote();
                if !self.try_advance_round() {
                    let next = self.step + 1;
                    self.enter_step(next);
                }
            }
        }
    }

    fn enter_step(&mut self, step: Step) {
        self.step = step;
        self.step_deadline = Instant::now() + self.step_duration();
        debug!(period = self.period, round = self.round, step, "entering step");
        match step {
            s if s == PROPOSE_STEP => self.propose(),
            s if s == CERT_STEP => {
                // Cert-vote immediately if the soft threshold is already in.
                self.try_cert_vote();
            }
            _ => {}
        }
    }

    // ── Voting actions ───────────────────────────────────────────────────────

    /// Step 1: if sortition elects this node, build a block anchored under
    /// the GHOST cap and broadcast body + propose vote.
    fn propose(&mut self) {
        let Some((weight, output)) = self.own_sortition(PROPOSE_STEP) else {
            return;
        };
        if weight == 0 {
            return;
        }
        let anchor = match self.dag.select_anchor(&self.prev_anchor, &self.config.ghost) {
            Ok(anchor) => anchor,
            Err(e) => {
                warn!(error = %e, "anchor selection failed");
                return;
            }
        };
        let (dag_hashes, tx_hashes) = match self.period_order(&anchor) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "period set unavailable");
                return;
            }
        };
        let order_hash = PbftBlock::compute_order_hash(&dag_hashes, &tx_hashes);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut block = PbftBlock::new(
            self.period,
            self.prev_block_hash,
            anchor,
            order_hash,
            self.key.address,
            timestamp,
        );
        block.sign(&self.key);
        let hash = block.hash();
        info!(period = self.period, round = self.round, block = %hash, "proposing");
        self.proposal_bodies.insert(hash, block.clone());
        self.proposals.insert(hash, output);
        self.outbox.push(ConsensusEvent::BroadcastBlock(block));
        self.cast_vote(hash, PROPOSE_STEP);
    }

    /// Step 2: soft-vote the locked value, a carried-over 2f+1 value from
    /// the previous round, or the proposal with the lowest VRF output.
    fn cast_soft_vote(&mut self) {
        if self.soft_voted.is_some() {
            return;
        }
        let choice = if let Some(locked) = self.locked_value {
            Some(locked)
        } else if let Some(bundle) = &self.carry_bundle {
            (bundle.voted_value != NULL_BLOCK_HASH).then_some(bundle.voted_value)
        } else {
            None
        };
        let choice = choice.or_else(|| {
            self.proposals
                .iter()
                .min_by(|(ha, oa), (hb, ob)| {
                    oa.0.as_slice()
                        .cmp(ob.0.as_slice())
                        .then_with(|| ha.cmp(hb))
                })
                .map(|(hash, _)| *hash)
        });
        if let Some(value) = choice {
            self.soft_voted = Some(value);
            self.cast_vote(value, SOFT_STEP);
        }
    }

    /// Step 3: cert-vote once 2f+1 soft weight converges on one value.
    fn try_cert_vote(&mut self) {
        if self.cert_voted || self.step != CERT_STEP {
            return;
        }
        if let Some((value, _)) = self.votes.winner_at(self.period, self.round, SOFT_STEP) {
            self.cert_voted = true;
            self.locked_value = Some(value);
            self.cast_vote(value, CERT_STEP);
        }
    }

    /// Steps ≥ 4: relay the strongest certified knowledge, else null.
    fn cast_next_vote(&mut self) {
        let value = if let Some((v, _)) = self.votes.winner_at(self.period, self.round, CERT_STEP)
        {
            v
        } else if self.step > FIRST_NEXT_STEP {
            match self.votes.winner_at(self.period, self.round, self.step - 1) {
                Some((v, _)) => v,
                None => NULL_BLOCK_HASH,
            }
        } else {
            NULL_BLOCK_HASH
        };
        self.cast_vote(value, self.step);
    }

    /// Sortition-gate, sign, self-apply and queue one vote for broadcast.
    fn cast_vote(&mut self, value: BlockHash, step: Step) {
        let Some((weight, _)) = self.own_sortition(step) else {
            return;
        };
        if weight == 0 {
            debug!(step, "not elected for step");
            return;
        }
        let vote = Vote::signed(
            value,
            self.period,
            self.round,
            step,
            &self.period_hash(),
            &self.vrf_key,
            &self.key,
        );
        // Count our own vote before telling anyone else.
        let _ = self.votes.add(vote.clone(), &self.period_hash());
        self.outbox.push(ConsensusEvent::BroadcastVote(vote));
        self.poll_progress();
    }

    /// This node's sortition weight for a step of the current round.
    fn own_sortition(&self, step: Step) -> Option<(VoteWeight, VrfOutput)> {
        let snapshot_period = self
            .period
            .saturating_sub(self.config.committee.delegation_delay);
        let table: Arc<StakeTable> = self.votes.stake_view().snapshot_at(snapshot_period)?;
        let entry = table.get(&self.key.address)?;
        let msg = VrfSortition::vrf_message(self.period, self.round, step, &self.period_hash());
        let (_, output) = self.vrf_key.prove(&msg);
        let weight = sortition_weight(
            &output,
            entry.stake,
            table.total_stake(),
            self.config.committee.expected_weight(step),
        );
        Some((weight, output))
    }

    // ── Progress / finalization ──────────────────────────────────────────────

    /// Called after every accepted vote: finalize on 2f+1 cert weight,
    /// otherwise try cert-voting or a round change.
    fn poll_progress(&mut self) {
        if self.pending_finalize.is_none() {
            if let Some((value, weight)) =
                self.votes.winner_at(self.period, self.round, CERT_STEP)
            {
                info!(
                    period = self.period,
                    round = self.round,
                    %value,
                    weight,
                    "cert threshold reached"
                );
                self.finalize(value);
                return;
            }
        }
        if self.step >= FIRST_NEXT_STEP {
            self.try_advance_round();
        } else if self.step == CERT_STEP {
            self.try_cert_vote();
        }
    }

    fn finalize(&mut self, value: BlockHash) {
        let Some(block) = self.proposal_bodies.get(&value).cloned() else {
            debug!(%value, "cert-finalized value without body, waiting for block");
            self.pending_finalize = Some(value);
            return;
        };
        let cert_votes = self
            .votes
            .votes_for(self.period, self.round, CERT_STEP, &value);
        let finalized = FinalizedPeriod {
            period: self.period,
            block: block.clone(),
            cert_votes,
        };
        info!(period = self.period, block = %value, "period finalized");
        self.outbox.push(ConsensusEvent::Finalized(finalized));

        // Advance the head. The finalized period's shard stays for the next
        // period's reward bundle; everything older is pruned.
        self.votes.prune_below(self.period);
        self.period += 1;
        self.prev_block_hash = value;
        self.prev_anchor = block.dag_block_hash;
        self.round = 1;
        self.locked_value = None;
        self.proposal_bodies.clear();
        self.proposals.clear();
        self.soft_voted = None;
        self.cert_voted = false;
        self.pending_finalize = None;
        self.carry_bundle = None;
        self.enter_step(PROPOSE_STEP);
    }

    /// Round change: needs a 2f+1 next-votes bundle from this round.
    fn try_advance_round(&mut self) -> bool {
        let Some(bundle) = self.votes.next_votes_bundle(self.period, self.round) else {
            return false;
        };
        // Unlock if a later-round supermajority moved off our locked value.
        if let Some(locked) = self.locked_value {
            if bundle.voted_value != locked {
                debug!(%locked, new = %bundle.voted_value, "unlocking");
                self.locked_value = None;
            }
        }
        info!(period = self.period, from_round = self.round, "round change");
        self.round += 1;
        self.carry_bundle = Some(bundle);
        self.proposals.clear();
        self.soft_voted = None;
        self.cert_voted = false;
        self.enter_step(PROPOSE_STEP);
        true
    }

    /// Canonical (dag hashes, tx hashes) order for a candidate anchor.
    fn period_order(
        &self,
        anchor: &BlockHash,
    ) -> Result<(Vec<BlockHash>, Vec<TxHash>), TrellisError> {
        let set = self.dag.period_set(anchor)?;
        let dag_hashes: Vec<BlockHash> = set.iter().map(|b| b.hash()).collect();
        let mut seen = HashSet::new();
        let mut tx_hashes = Vec::new();
        for block in &set {
            for tx in &block.transactions {
                if seen.insert(*tx) {
                    tx_hashes.push(*tx);
                }
            }
        }
        Ok((dag_hashes, tx_hashes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitteeConfig, StakeEntry, StaticStakeView};
    use trellis_dag::block::DagBlock;

    struct Member {
        kp: Arc<KeyPair>,
        vrf: Arc<VrfKeyPair>,
    }

    /// Committee where every member's full stake always wins sortition
    /// (τ = total stake forces p = 1).
    fn build(n: u8, stake_each: u64) -> (Vec<Member>, Arc<VoteManager>, PbftConfig) {
        let members: Vec<Member> = (0..n)
            .map(|i| Member {
                kp: Arc::new(KeyPair::generate()),
                vrf: Arc::new(VrfKeyPair::from_seed(&[i + 10; 32])),
            })
            .collect();
        let total = u64::from(n) * stake_each;
        let committee = CommitteeConfig {
            soft_committee: total,
            cert_committee: total,
            delegation_delay: 0,
        };
        let table = StakeTable::new(members.iter().map(|m| {
            (
                m.kp.address,
                StakeEntry {
                    stake: stake_each,
                    vrf_key: m.vrf.public_key(),
                },
            )
        }));
        let votes = Arc::new(VoteManager::new(
            committee,
            Arc::new(StaticStakeView::new(table)),
        ));
        let config = PbftConfig {
            committee,
            lambda_ms: 50,
            ..PbftConfig::default()
        };
        (members, votes, config)
    }

    fn engine_for(member: &Member, votes: &Arc<VoteManager>, config: &PbftConfig) -> PbftEngine {
        let dag = Arc::new(DagManager::new(DagBlock::genesis()));
        let head = ChainHead {
            period: 1,
            prev_block_hash: NULL_BLOCK_HASH,
            prev_anchor: dag.genesis_hash(),
        };
        PbftEngine::new(
            config.clone(),
            Arc::clone(&member.kp),
            Arc::clone(&member.vrf),
            Arc::clone(votes),
            dag,
            head,
        )
    }

    #[tokio::test]
    async fn single_voter_finalizes_a_period() {
        let (members, votes, config) = build(1, 3);
        let mut engine = engine_for(&members[0], &votes, &config);

        engine.start(); // proposes
        engine.on_step_timeout(); // step 1 → 2
        engine.on_step_timeout(); // soft vote, step 2 → 3; cert + finalize cascade

        assert_eq!(engine.period(), 2, "single-voter committee self-finalizes");
        let events = engine.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::BroadcastBlock(_))));
        let finalized = events.iter().find_map(|e| match e {
            ConsensusEvent::Finalized(f) => Some(f),
            _ => None,
        });
        let finalized = finalized.expect("finalized event");
        assert_eq!(finalized.period, 1);
        assert!(!finalized.cert_votes.is_empty());
    }

    #[tokio::test]
    async fn round_advances_on_null_next_votes() {
        let (members, votes, config) = build(4, 1);
        // 2f+1 for τ = 4 is 3: our own null next-vote plus two others.
        let mut engine = engine_for(&members[0], &votes, &config);
        engine.start();
        engine.on_step_timeout(); // → soft
        engine.on_step_timeout(); // → cert (no 2f+1 soft: weight 1 < 3)
        engine.on_step_timeout(); // → first next step
        assert_eq!(engine.step(), FIRST_NEXT_STEP);
        engine.on_step_timeout(); // casts own null next-vote, no bundle yet
        assert_eq!(engine.round(), 1);

        for member in &members[1..3] {
            let vote = Vote::signed(
                NULL_BLOCK_HASH,
                1,
                1,
                FIRST_NEXT_STEP,
                &NULL_BLOCK_HASH,
                &member.vrf,
                &member.kp,
            );
            engine.handle_vote(vote);
        }
        assert_eq!(engine.round(), 2, "2f+1 null next-votes advance the round");
        assert_eq!(engine.step(), PROPOSE_STEP);
    }

    #[tokio::test]
    async fn quorum_of_four_finalizes_with_injected_votes() {
        let (members, votes, config) = build(4, 1);
        let mut engine = engine_for(&members[0], &votes, &config);
        engine.start();
        let events = engine.take_events();
        let block = events
            .iter()
            .find_map(|e| match e {
                ConsensusEvent::BroadcastBlock(b) => Some(b.clone()),
                _ => None,
            })
            .expect("own proposal");
        let value = block.hash();

        engine.on_step_timeout(); // → soft step: soft-votes own proposal
        for member in &members[1..3] {
            let vote = Vote::signed(
                value,
                1,
                1,
                SOFT_STEP,
                &NULL_BLOCK_HASH,
                &member.vrf,
                &member.kp,
            );
            engine.handle_vote(vote);
        }
        engine.on_step_timeout(); // → cert step, 2f+1 soft present → cert vote
        for member in &members[1..3] {
            let vote = Vote::signed(
                value,
                1,
                1,
                CERT_STEP,
                &NULL_BLOCK_HASH,
                &member.vrf,
                &member.kp,
            );
            engine.handle_vote(vote);
        }
        assert_eq!(engine.period(), 2, "2f+1 cert votes finalize");
        let finalized = engine.take_events().into_iter().find_map(|e| match e {
            ConsensusEvent::Finalized(f) => Some(f),
            _ => None,
        });
        assert_eq!(finalized.expect("finalized").block.hash(), value);
    }
}
