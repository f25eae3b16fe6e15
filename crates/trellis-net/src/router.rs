//! Packet validation and dispatch.
//!
//! One router instance sits behind the worker pool: every decoded packet is
//! validated against local state and either forwarded into the consensus
//! channels, answered directly (sync requests), or reported as malicious.
//! The router reaches consensus only through narrow handles (channels, the
//! vote manager, the DAG manager) — no back-references.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use trellis_consensus::engine::FinalizedPeriod;
use trellis_consensus::pbft_block::PbftBlock;
use trellis_consensus::vote::Vote;
use trellis_core::error::TrellisError;
use trellis_core::types::{BlockHash, Period};
use trellis_crypto::vdf::VdfParams;
use trellis_dag::manager::DagManager;
use trellis_pool::{AccountView, TransactionPool};
use trellis_state::final_chain::FinalChain;

use crate::packet::{Packet, StatusInitial, StatusUpdate};
use crate::peer::PeerTable;

/// How replies and broadcasts leave the router. The gossip service
/// implements this.
pub trait Transport: Send + Sync {
    fn send(&self, peer: &PeerId, packet: Packet);
    fn broadcast(&self, packet: Packet);
    fn disconnect(&self, peer: &PeerId);
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub chain_id: u64,
    pub genesis_hash: BlockHash,
    pub vdf: VdfParams,
    /// Periods streamed per GetPbftSync request.
    pub sync_batch: u64,
}

/// Validates inbound packets and routes them to their consumers.
pub struct PacketRouter<V: AccountView + Send + Sync> {
    config: RouterConfig,
    peers: Arc<PeerTable>,
    dag: Arc<DagManager>,
    pool: Arc<TransactionPool>,
    account_view: Arc<V>,
    final_chain: Arc<FinalChain>,
    votes_tx: mpsc::Sender<Vote>,
    blocks_tx: mpsc::Sender<PbftBlock>,
    transport: Arc<dyn Transport>,
}

impl<V: AccountView + Send + Sync> PacketRouter<V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        peers: Arc<PeerTable>,
        dag: Arc<DagManager>,
        pool: Arc<TransactionPool>,
        account_view: Arc<V>,
        final_chain: Arc<FinalChain>,
        votes_tx: mpsc::Sender<Vote>,
        blocks_tx: mpsc::Sender<PbftBlock>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            peers,
            dag,
            pool,
            account_view,
            final_chain,
            votes_tx,
            blocks_tx,
            transport,
        }
    }

    /// Process one packet from one peer. Errors returned here mean the peer
    /// misbehaved; the caller translates them into suspicion or a
    /// disconnect.
    pub fn handle(&self, peer: &PeerId, packet: Packet) -> Result<(), TrellisError> {
        match packet {
            Packet::StatusInitial(status) => self.on_status_initial(peer, status),
            Packet::StatusUpdate(status) => {
                self.on_status_update(peer, status);
                Ok(())
            }
            Packet::Vote(vote) => {
                self.peers
                    .with_peer(peer, |p| p.mark_vote_known(vote.vote_hash()));
                let _ = self.votes_tx.try_send(vote);
                Ok(())
            }
            Packet::PbftBlock(block) => {
                let _ = self.blocks_tx.try_send(block);
                Ok(())
            }
            Packet::DagBlock {
                block,
                transactions,
            } => self.on_dag_block(peer, block, transactions),
            Packet::Transactions(transactions) => {
                self.on_transactions(peer, transactions);
                Ok(())
            }
            Packet::GetDagSync { known_tips, period } => {
                self.on_get_dag_sync(peer, known_tips, period);
                Ok(())
            }
            Packet::DagSync {
                blocks,
                transactions,
            } => self.on_dag_sync(peer, blocks, transactions),
            Packet::GetPbftSync { from_period } => {
                self.on_get_pbft_sync(peer, from_period);
                Ok(())
            }
            Packet::PbftSync { data, remaining } => self.on_pbft_sync(peer, *data, remaining),
            Packet::GetNextVotesSync { period, round } => {
                self.on_get_next_votes(peer, period, round);
                Ok(())
            }
            Packet::VotesBundle(bundle) => {
                // Feed the bundle's votes through the normal vote path; the
                // engine's vote manager re-validates each one.
                for vote in bundle.votes {
                    let _ = self.votes_tx.try_send(vote);
                }
                Ok(())
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────────────

    fn on_status_initial(
        &self,
        peer: &PeerId,
        status: StatusInitial,
    ) -> Result<(), TrellisError> {
        if status.chain_id != self.config.chain_id
            || status.genesis_hash != self.config.genesis_hash
        {
            warn!(peer = %peer, "status handshake chain mismatch");
            self.transport.disconnect(peer);
            self.peers.blacklist(peer, "chain mismatch");
            return Err(TrellisError::PeerChainMismatch);
        }
        self.peers.register(*peer);
        self.peers.with_peer(peer, |p| {
            p.pbft_period = status.pbft_chain_size;
            p.pbft_round = status.pbft_round;
            p.dag_level = status.dag_level;
            p.syncing = status.syncing;
            p.is_light_node = status.is_light_node;
        });
        info!(peer = %peer, period = status.pbft_chain_size, "peer handshake complete");

        // Start catching up immediately if the peer is ahead.
        let our_period = self.final_chain.head().period;
        if status.pbft_chain_size > our_period {
            self.transport.send(
                peer,
                Packet::GetPbftSync {
                    from_period: our_period + 1,
                },
            );
        }
        Ok(())
    }

    fn on_status_update(&self, peer: &PeerId, status: StatusUpdate) {
        self.peers.with_peer(peer, |p| {
            p.pbft_period = status.pbft_chain_size;
            p.pbft_round = status.pbft_round;
            p.dag_level = status.dag_level;
            p.syncing = status.syncing;
        });
    }

    // ── DAG ──────────────────────────────────────────────────────────────────

    fn on_dag_block(
        &self,
        peer: &PeerId,
        block: trellis_dag::block::DagBlock,
        transactions: Vec<trellis_core::transaction::Transaction>,
    ) -> Result<(), TrellisError> {
        let hash = block.hash();
        self.peers.with_peer(peer, |p| p.mark_dag_block_known(hash));
        self.on_transactions(peer, transactions);

        let now = unix_now();
        let period_hash = self.final_chain.head().pbft_block_hash;
        match self
            .dag
            .insert(block, &period_hash, self.config.vdf.difficulty_min, now)
        {
            Ok(_) => Ok(()),
            Err(TrellisError::MissingParent { parent, .. }) => {
                // A gap, not an attack: ask the peer for what we miss.
                debug!(peer = %peer, %parent, "missing DAG parent, requesting sync");
                self.transport.send(
                    peer,
                    Packet::GetDagSync {
                        known_tips: self.dag.tips(),
                        period: self.final_chain.head().period,
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "invalid DAG block");
                Err(e)
            }
        }
    }

    fn on_transactions(
        &self,
        peer: &PeerId,
        transactions: Vec<trellis_core::transaction::Transaction>,
    ) {
        for tx in transactions {
            self.peers
                .with_peer(peer, |p| p.mark_transaction_known(tx.hash()));
            let _ = self.pool.insert(tx, self.account_view.as_ref());
        }
    }

    fn on_get_dag_sync(&self, peer: &PeerId, known_tips: Vec<BlockHash>, _period: Period) {
        let known: std::collections::HashSet<BlockHash> = known_tips.into_iter().collect();
        let mut blocks = Vec::new();
        let mut transactions = Vec::new();
        for tip in self.dag.tips() {
            if known.contains(&tip) {
                continue;
            }
            if let Some(block) = self.dag.get(&tip) {
                for tx_hash in &block.transactions {
                    if let Some(tx) = self.pool.get(tx_hash) {
                        transactions.push(tx.as_ref().clone());
                    } else if let Ok(Some(tx)) = self.final_chain.db().transaction(tx_hash) {
                        transactions.push(tx);
                    }
                }
                blocks.push(block.as_ref().clone());
            }
        }
        if !blocks.is_empty() {
            self.transport.send(
                peer,
                Packet::DagSync {
                    blocks,
                    transactions,
                },
            );
        }
    }

    fn on_dag_sync(
        &self,
        peer: &PeerId,
        blocks: Vec<trellis_dag::block::DagBlock>,
        transactions: Vec<trellis_core::transaction::Transaction>,
    ) -> Result<(), TrellisError> {
        self.on_transactions(peer, transactions);
        let period_hash = self.final_chain.head().pbft_block_hash;
        let now = unix_now();
        for block in blocks {
            match self
                .dag
                .insert(block, &period_hash, self.config.vdf.difficulty_min, now)
            {
                Ok(_) | Err(TrellisError::MissingParent { .. }) => {}
                Err(e) => {
                    warn!(peer = %peer, error = %e, "invalid block in DAG sync");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ── PBFT sync ────────────────────────────────────────────────────────────

    fn on_get_pbft_sync(&self, peer: &PeerId, from_period: Period) {
        let head = self.final_chain.head().period;
        if from_period > head {
            return;
        }
        let to = (from_period + self.config.sync_batch - 1).min(head);
        for period in from_period..=to {
            match self.final_chain.db().period_data(period) {
                Ok(Some(data)) => {
                    self.transport.send(
                        peer,
                        Packet::PbftSync {
                            data: Box::new(data),
                            remaining: head - period,
                        },
                    );
                }
                Ok(None) => {
                    warn!(period, "period data missing while serving sync");
                    break;
                }
                Err(e) => {
                    warn!(period, error = %e, "period data read failed");
                    break;
                }
            }
        }
    }

    /// Apply one synced period: cert votes must carry 2f+1 weight before
    /// anything is committed.
    fn on_pbft_sync(
        &self,
        peer: &PeerId,
        data: trellis_state::db::PeriodData,
        remaining: u64,
    ) -> Result<(), TrellisError> {
        let our_next = self.final_chain.head().period + 1;
        if data.pbft_block.period < our_next {
            debug!(peer = %peer, period = data.pbft_block.period, "stale sync period ignored");
            return Ok(());
        }
        if data.pbft_block.period > our_next {
            // Out-of-order delivery; ask again from where we actually are.
            self.transport.send(
                peer,
                Packet::GetPbftSync {
                    from_period: our_next,
                },
            );
            return Ok(());
        }

        verify_cert_quorum(&data, &self.final_chain)?;

        // Adopt the period's DAG blocks, then execute.
        let period_hash = data.pbft_block.prev_block_hash;
        let now = unix_now();
        for block in &data.dag_blocks {
            let _ = self
                .dag
                .insert(block.clone(), &period_hash, self.config.vdf.difficulty_min, now);
        }
        let dag_blocks: Vec<Arc<trellis_dag::block::DagBlock>> = data
            .dag_blocks
            .iter()
            .map(|b| Arc::new(b.clone()))
            .collect();
        let finalized = FinalizedPeriod {
            period: data.pbft_block.period,
            block: data.pbft_block.clone(),
            cert_votes: data.cert_votes.iter().cloned().map(Arc::new).collect(),
        };
        let by_hash: std::collections::HashMap<_, _> = data
            .transactions
            .iter()
            .map(|tx| (tx.hash(), tx.clone()))
            .collect();
        self.final_chain
            .finalize_period(&finalized, &dag_blocks, &|h| by_hash.get(h).cloned())?;
        self.dag.assign_period(
            data.pbft_block.period,
            &dag_blocks.iter().map(|b| b.hash()).collect::<Vec<_>>(),
        );
        for tx in &data.transactions {
            self.pool.remove(&tx.hash());
        }
        info!(period = data.pbft_block.period, remaining, "synced period applied");

        if remaining > 0 {
            self.transport.send(
                peer,
                Packet::GetPbftSync {
                    from_period: data.pbft_block.period + 1,
                },
            );
        }
        Ok(())
    }

    // ── Next-votes sync ──────────────────────────────────────────────────────

    fn on_get_next_votes(&self, peer: &PeerId, period: Period, round: u32) {
        if let Ok(Some(bundle)) = self.final_chain.db().next_votes_bundle(period, round) {
            self.transport.send(peer, Packet::VotesBundle(bundle));
        }
    }
}

/// Sum the weights behind a synced period's cert votes and require 2f+1.
/// Weights are re-derived locally; a forged bundle cannot import weight.
fn verify_cert_quorum(
    data: &trellis_state::db::PeriodData,
    final_chain: &FinalChain,
) -> Result<(), TrellisError> {
    let block_hash = data.pbft_block.hash();
    for vote in &data.cert_votes {
        if vote.block_hash != block_hash
            || vote.sortition.period != data.pbft_block.period
            || vote.sortition.step != trellis_core::constants::CERT_STEP
        {
            return Err(TrellisError::MaliciousPeer(
                "cert vote outside finalized block scope".into(),
            ));
        }
    }
    let quorum =
        final_chain.cert_quorum_weight(&data.cert_votes, &data.pbft_block.prev_block_hash);
    if quorum.0 < quorum.1 {
        return Err(TrellisError::MaliciousPeer(format!(
            "cert quorum {} below 2f+1 threshold {}",
            quorum.0, quorum.1
        )));
    }
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
