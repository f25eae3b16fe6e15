//! Node orchestrator: builds every component from config, wires the
//! channels between them, runs the long-lived workers, and owns graceful
//! shutdown (stop intake → drain packet queue → stop the engine → flush).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use trellis_consensus::config::StaticStakeView;
use trellis_consensus::engine::{ChainHead, ConsensusEvent, FinalizedPeriod, PbftEngine};
use trellis_consensus::sortition::sortition_weight;
use trellis_consensus::vote::Vote;
use trellis_consensus::vote_manager::VoteManager;
use trellis_core::constants::CERT_STEP;
use trellis_core::error::TrellisError;
use trellis_core::types::{Period, TxHash, H256};
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vdf::{select_difficulty, solve};
use trellis_crypto::vrf::{verify_vrf, VrfKeyPair};
use trellis_dag::block::DagBlock;
use trellis_dag::manager::DagManager;
use trellis_net::packet::{Packet, StatusInitial, StatusUpdate};
use trellis_net::peer::{PeerConfig, PeerTable};
use trellis_net::queue::PacketQueue;
use trellis_net::router::{PacketRouter, RouterConfig, Transport};
use trellis_net::service::{GossipConfig, GossipService};
use trellis_pool::{AccountView, PoolConfig, TransactionPool};
use trellis_state::db::StateDb;
use trellis_state::exec::TransferVm;
use trellis_state::final_chain::{FinalChain, VoteWeigher};
use trellis_genesis::{ensure_genesis, GenesisConfig};

use crate::config::NodeConfig;

const NODE_VERSION: (u32, u32, u32) = (0, 1, 0);

/// Per-packet worker-time budget before a peer counts as suspicious.
const MAX_PACKET_PROCESSING: Duration = Duration::from_millis(500);

/// Pool validation reads account state straight off the final chain.
pub struct ChainAccountView(pub Arc<FinalChain>);

impl AccountView for ChainAccountView {
    fn account_nonce(&self, addr: &trellis_core::types::Address) -> u64 {
        self.0.account(addr).nonce
    }

    fn account_balance(&self, addr: &trellis_core::types::Address) -> trellis_core::types::U256 {
        self.0.account(addr).balance
    }
}

/// Weight re-derivation for persisted votes: recover the voter, verify the
/// VRF against the supplied period-binding hash, run sortition. Invalid
/// votes weigh zero.
pub fn build_vote_weigher(genesis: &GenesisConfig) -> Result<VoteWeigher, TrellisError> {
    let table = Arc::new(genesis.stake_table()?);
    let committee = genesis.committee();
    Ok(Arc::new(move |vote: &Vote, period_hash: &H256| -> u64 {
        let Ok(voter) = vote.voter() else { return 0 };
        let Some(entry) = table.get(&voter) else { return 0 };
        let msg = vote.sortition.message(period_hash);
        let Ok(output) = verify_vrf(&entry.vrf_key, &vote.sortition.proof, &msg) else {
            return 0;
        };
        sortition_weight(
            &output,
            entry.stake,
            table.total_stake(),
            committee.expected_weight(vote.sortition.step),
        )
    }))
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Apply one locally finalized period: execute, prune the pool, advance the
/// DAG bookkeeping, announce the new head.
#[allow(clippy::too_many_arguments)]
pub fn apply_finalized(
    finalized: &FinalizedPeriod,
    dag: &DagManager,
    pool: &TransactionPool,
    final_chain: &FinalChain,
    transport: &dyn Transport,
) -> Result<(), TrellisError> {
    let set = dag.period_set(&finalized.block.dag_block_hash)?;
    let db = Arc::clone(final_chain.db());
    let pool_for_lookup = pool.clone();
    let provider = move |h: &TxHash| {
        pool_for_lookup
            .get(h)
            .map(|tx| tx.as_ref().clone())
            .or_else(|| db.transaction(h).ok().flatten())
    };
    let header = final_chain.finalize_period(finalized, &set, &provider)?;

    let hashes: Vec<_> = set.iter().map(|b| b.hash()).collect();
    dag.assign_period(finalized.period, &hashes);
    for block in &set {
        for tx in &block.transactions {
            pool.remove(tx);
        }
    }

    let head = final_chain.head();
    transport.broadcast(Packet::StatusUpdate(StatusUpdate {
        pbft_chain_size: head.period,
        pbft_round: 1,
        dag_level: dag.max_level(),
        syncing: false,
    }));
    info!(
        period = finalized.period,
        header = %header.hash(),
        dag_blocks = hashes.len(),
        "finalized period applied"
    );
    Ok(())
}

/// Run the full node until ctrl-c. Consistency failures (order-hash
/// mismatch after 2f+1) abort with the error so main can map the exit code.
pub async fn run(
    config: NodeConfig,
    data_dir: std::path::PathBuf,
    revert_to: Option<Period>,
) -> Result<(), TrellisError> {
    trellis_core::constants::init_sentinels();

    let db = Arc::new(StateDb::open(&data_dir)?);
    let genesis_state = ensure_genesis(&db, &config.genesis)?;

    // ── Identity ─────────────────────────────────────────────────────────────
    let node_key = Arc::new(match &config.node_secret {
        Some(s) => KeyPair::from_secret_bytes(&NodeConfig::parse_secret(s)?)
            .map_err(|_| TrellisError::Config("invalid node secret".into()))?,
        None => {
            warn!("no node_secret configured, generating an ephemeral key");
            KeyPair::generate()
        }
    });
    let vrf_key = Arc::new(match &config.vrf_seed {
        Some(s) => VrfKeyPair::from_seed(&NodeConfig::parse_secret(s)?),
        None => VrfKeyPair::generate(),
    });
    info!(address = %node_key.address, "node identity");

    // ── Core components ──────────────────────────────────────────────────────
    let committee = config.genesis.committee();
    let stake_view = Arc::new(StaticStakeView::new(config.genesis.stake_table()?));
    let vote_mgr = Arc::new(VoteManager::new(committee, stake_view));
    let dag = Arc::new(DagManager::new(genesis_state.dag_genesis.clone()));
    let weigher = build_vote_weigher(&config.genesis)?;
    let final_chain = Arc::new(FinalChain::new(
        Arc::clone(&db),
        Arc::new(TransferVm),
        config.genesis.rewards(),
        config.genesis.gas_limit,
        committee.two_t_plus_one(CERT_STEP),
        weigher,
    )?);
    if let Some(period) = revert_to {
        final_chain.revert_to(period)?;
    }
    let pool = Arc::new(TransactionPool::new(PoolConfig {
        capacity: config.pool_capacity,
        chain_id: config.genesis.chain_id,
        block_gas_limit: config.genesis.gas_limit,
    }));
    let account_view = Arc::new(ChainAccountView(Arc::clone(&final_chain)));

    // ── Networking ───────────────────────────────────────────────────────────
    let gossip_config = GossipConfig {
        listen_addr: config.listen_addr.clone(),
        boot_nodes: config.boot_nodes.clone(),
        ..GossipConfig::default()
    };
    let (service, handle, mut inbound_rx, mut conn_rx) = GossipService::new(&gossip_config)
        .map_err(|e| TrellisError::Config(format!("building gossip service: {e}")))?;
    info!(peer_id = %handle.local_peer_id, "gossip identity");
    let transport: Arc<dyn Transport> = Arc::new(handle);
    let peers = Arc::new(PeerTable::new(PeerConfig::default()));
    let queue = Arc::new(PacketQueue::new(config.packet_queue_capacity));

    let (events_tx, mut events_rx) = mpsc::channel::<ConsensusEvent>(256);
    let (votes_tx, votes_rx) = mpsc::channel::<Vote>(1024);
    let (blocks_tx, blocks_rx) = mpsc::channel(64);

    let router = Arc::new(PacketRouter::new(
        RouterConfig {
            chain_id: config.genesis.chain_id,
            genesis_hash: genesis_state.genesis_hash,
            vdf: config.genesis.vdf_params(),
            sync_batch: 64,
        },
        Arc::clone(&peers),
        Arc::clone(&dag),
        Arc::clone(&pool),
        Arc::clone(&account_view),
        Arc::clone(&final_chain),
        votes_tx.clone(),
        blocks_tx.clone(),
        Arc::clone(&transport),
    ));

    // ── Engine ───────────────────────────────────────────────────────────────
    let head = final_chain.head();
    let prev_anchor = db
        .pbft_block(head.period)?
        .map(|b| b.dag_block_hash)
        .unwrap_or_else(|| dag.genesis_hash());
    let engine = PbftEngine::new(
        config.genesis.pbft_config(),
        Arc::clone(&node_key),
        Arc::clone(&vrf_key),
        Arc::clone(&vote_mgr),
        Arc::clone(&dag),
        ChainHead {
            period: head.period + 1,
            prev_block_hash: head.pbft_block_hash,
            prev_anchor,
        },
    );

    // ── Workers ──────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let vdf_cancel = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(service.run()));
    tasks.push(tokio::spawn(engine.run(
        events_tx,
        votes_rx,
        blocks_rx,
        shutdown_rx.clone(),
    )));

    // Packet workers: cross-peer parallel, per-peer serial via the queue.
    for worker in 0..config.packet_workers.max(1) {
        let queue = Arc::clone(&queue);
        let router = Arc::clone(&router);
        let peers = Arc::clone(&peers);
        let transport = Arc::clone(&transport);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            debug!(worker, "packet worker started");
            loop {
                let queued = tokio::select! {
                    queued = queue.pop() => queued,
                    _ = shutdown.changed() => break,
                };
                let peer = queued.peer;
                let started = std::time::Instant::now();
                match router.handle(&peer, queued.packet) {
                    Ok(()) => {}
                    Err(TrellisError::PeerChainMismatch) => {
                        // Router already blacklisted and disconnected.
                    }
                    Err(TrellisError::MaliciousPeer(reason)) => {
                        peers.blacklist(&peer, &reason);
                        transport.disconnect(&peer);
                    }
                    Err(e @ TrellisError::OrderMismatch { .. }) => {
                        // Consistency failure during sync: the committee or
                        // this build has forked from the network. Halt.
                        error!(error = %e, "consistency failure, halting");
                        std::process::exit(3);
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "packet rejected");
                        if peers.report_suspicious(&peer) {
                            transport.disconnect(&peer);
                        }
                    }
                }
                // A peer whose packets keep eating worker time gets
                // throttled through the same sliding window.
                if started.elapsed() > MAX_PACKET_PROCESSING && peers.report_suspicious(&peer) {
                    transport.disconnect(&peer);
                }
                queue.complete(&peer);
            }
        }));
    }

    // Inbound pump: decode, drop blacklisted, enqueue by priority.
    {
        let queue = Arc::clone(&queue);
        let peers = Arc::clone(&peers);
        let transport = Arc::clone(&transport);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let (peer, bytes) = tokio::select! {
                    maybe = inbound_rx.recv() => match maybe {
                        Some(v) => v,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                if peers.is_blacklisted(&peer) {
                    continue;
                }
                match Packet::decode(&bytes) {
                    Ok(packet) => {
                        if let Err(e) = queue.push(peer, packet) {
                            warn!(error = %e, "packet queue overflow, dropping");
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "undecodable packet");
                        if peers.report_suspicious(&peer) {
                            transport.disconnect(&peer);
                        }
                    }
                }
            }
        }));
    }

    // Connection pump: handshake on connect, cleanup on disconnect.
    {
        let peers = Arc::clone(&peers);
        let transport = Arc::clone(&transport);
        let final_chain = Arc::clone(&final_chain);
        let dag = Arc::clone(&dag);
        let chain_id = config.genesis.chain_id;
        let genesis_hash = genesis_state.genesis_hash;
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let (peer, connected) = tokio::select! {
                    maybe = conn_rx.recv() => match maybe {
                        Some(v) => v,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                if connected {
                    if !peers.register(peer) {
                        transport.disconnect(&peer);
                        continue;
                    }
                    let head = final_chain.head();
                    transport.send(
                        &peer,
                        Packet::StatusInitial(StatusInitial {
                            chain_id,
                            genesis_hash,
                            node_major: NODE_VERSION.0,
                            node_minor: NODE_VERSION.1,
                            node_patch: NODE_VERSION.2,
                            pbft_chain_size: head.period,
                            pbft_round: 1,
                            dag_level: dag.max_level(),
                            syncing: false,
                            is_light_node: false,
                            history: head.period,
                        }),
                    );
                } else {
                    peers.deregister(&peer);
                }
            }
        }));
    }

    // DAG proposer: package pending transactions behind the VDF gate.
    {
        let dag = Arc::clone(&dag);
        let pool = Arc::clone(&pool);
        let final_chain = Arc::clone(&final_chain);
        let transport = Arc::clone(&transport);
        let node_key = Arc::clone(&node_key);
        let vrf_key = Arc::clone(&vrf_key);
        let vdf_params = config.genesis.vdf_params();
        let stale_after = config.dag_stale_after_secs;
        let interval = Duration::from_millis(config.dag_proposal_interval_ms);
        let cancel = Arc::clone(&vdf_cancel);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let candidates = pool.top(200);
                if candidates.is_empty() {
                    continue;
                }
                let chain = dag.pivot_chain();
                let pivot = *chain.last().expect("pivot chain has genesis");
                let tips: Vec<_> = dag.tips().into_iter().filter(|t| *t != pivot).collect();
                let level = 1 + chain
                    .last()
                    .and_then(|h| dag.get(h))
                    .map(|b| b.level)
                    .unwrap_or(0)
                    .max(
                        tips.iter()
                            .filter_map(|t| dag.get(t))
                            .map(|b| b.level)
                            .max()
                            .unwrap_or(0),
                    );
                let now = now_secs();
                let period_hash = final_chain.head().pbft_block_hash;
                let challenge = DagBlock::vdf_challenge(level, &period_hash);
                let (vrf_proof, output) = vrf_key.prove(&challenge);
                let stale = dag.is_stale(now, stale_after);
                let difficulty = select_difficulty(&output, &vdf_params, stale);

                let cancel_for_solve = Arc::clone(&cancel);
                let challenge_for_solve = challenge.clone();
                let solved = tokio::task::spawn_blocking(move || {
                    solve(&challenge_for_solve, difficulty, &cancel_for_solve)
                })
                .await
                .ok()
                .flatten();
                let Some(vdf) = solved else { continue };

                let tx_hashes: Vec<TxHash> = candidates.iter().map(|tx| tx.hash()).collect();
                let mut block = DagBlock::new(
                    pivot,
                    tips,
                    level,
                    now,
                    vdf,
                    vrf_proof,
                    tx_hashes.clone(),
                );
                block.sign(&node_key);
                match dag.insert(block.clone(), &period_hash, vdf_params.difficulty_min, now) {
                    Ok(hash) => {
                        pool.guard(&tx_hashes);
                        transport.broadcast(Packet::DagBlock {
                            block,
                            transactions: candidates.iter().map(|tx| tx.as_ref().clone()).collect(),
                        });
                        debug!(block = %hash, txs = tx_hashes.len(), "DAG block proposed");
                    }
                    Err(e) => warn!(error = %e, "own DAG block rejected"),
                }
            }
        }));
    }

    // Status / bundle persistence / stall detection timer.
    {
        let transport = Arc::clone(&transport);
        let final_chain = Arc::clone(&final_chain);
        let dag = Arc::clone(&dag);
        let vote_mgr = Arc::clone(&vote_mgr);
        let peers = Arc::clone(&peers);
        let db = Arc::clone(&db);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(7));
            let mut last_period = final_chain.head().period;
            let mut stalled_ticks = 0u32;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let head = final_chain.head();
                transport.broadcast(Packet::StatusUpdate(StatusUpdate {
                    pbft_chain_size: head.period,
                    pbft_round: 1,
                    dag_level: dag.max_level(),
                    syncing: false,
                }));
                // Persist the current round-change bundle so stalled peers
                // can ask for it.
                let deciding = head.period + 1;
                for round in 1..=4u32 {
                    if let Some(bundle) = vote_mgr.next_votes_bundle(deciding, round) {
                        let _ = db.put_next_votes_bundle(&bundle);
                    }
                }
                // Round-stall recovery: no finalization progress for a few
                // ticks means we may be missing the round-change bundle.
                if head.period == last_period {
                    stalled_ticks += 1;
                    if stalled_ticks >= 3 {
                        if let Some((peer, _)) = peers.best_sync_candidate(0) {
                            for round in 1..=4u32 {
                                transport.send(
                                    &peer,
                                    Packet::GetNextVotesSync {
                                        period: deciding,
                                        round,
                                    },
                                );
                            }
                        }
                        stalled_ticks = 0;
                    }
                } else {
                    last_period = head.period;
                    stalled_ticks = 0;
                }
            }
        }));
    }

    info!("node ready");

    // ── Main loop: consensus events + shutdown ───────────────────────────────
    let run_result = loop {
        tokio::select! {
            maybe_event = events_rx.recv() => {
                let Some(event) = maybe_event else { break Ok(()) };
                match event {
                    ConsensusEvent::BroadcastVote(vote) => {
                        transport.broadcast(Packet::Vote(vote));
                    }
                    ConsensusEvent::BroadcastBlock(block) => {
                        transport.broadcast(Packet::PbftBlock(block));
                    }
                    ConsensusEvent::Finalized(finalized) => {
                        match apply_finalized(
                            &finalized,
                            &dag,
                            &pool,
                            &final_chain,
                            transport.as_ref(),
                        ) {
                            Ok(()) => {}
                            Err(e @ TrellisError::OrderMismatch { .. }) => {
                                error!(error = %e, "order mismatch after 2f+1 cert votes");
                                break Err(e);
                            }
                            Err(e) => {
                                error!(error = %e, "period application failed");
                            }
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break Ok(());
            }
        }
    };

    // ── Graceful shutdown ────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    vdf_cancel.store(true, Ordering::Relaxed);
    // Drain what is already queued (bounded wait).
    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !queue.is_empty() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    db.flush()?;
    for task in tasks {
        task.abort();
    }
    info!("node stopped");
    run_result
}

/// Rebuild the database by replaying persisted period data through a fresh
/// store (operator `--rebuild-db`).
pub fn rebuild_db(data_dir: &std::path::Path, config: &NodeConfig) -> Result<(), TrellisError> {
    let old = StateDb::open(data_dir)?;
    let Some(head) = old.latest_snapshot()? else {
        return Ok(()); // nothing to rebuild
    };
    let mut periods = Vec::new();
    for period in 1..=head.period {
        match old.period_data(period)? {
            Some(data) => periods.push(data),
            None => {
                return Err(TrellisError::Storage(format!(
                    "period {period} data missing, cannot rebuild"
                )))
            }
        }
    }
    drop(old);
    std::fs::remove_dir_all(data_dir).map_err(|e| TrellisError::Storage(e.to_string()))?;

    let db = Arc::new(StateDb::open(data_dir)?);
    ensure_genesis(&db, &config.genesis)?;
    let weigher = build_vote_weigher(&config.genesis)?;
    let final_chain = FinalChain::new(
        Arc::clone(&db),
        Arc::new(TransferVm),
        config.genesis.rewards(),
        config.genesis.gas_limit,
        config.genesis.committee().two_t_plus_one(CERT_STEP),
        weigher,
    )?;
    for data in periods {
        let dag_blocks: Vec<Arc<DagBlock>> =
            data.dag_blocks.iter().map(|b| Arc::new(b.clone())).collect();
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
        final_chain.finalize_period(&finalized, &dag_blocks, &|h| by_hash.get(h).cloned())?;
        info!(period = data.pbft_block.period, "rebuilt period");
    }
    Ok(())
}
