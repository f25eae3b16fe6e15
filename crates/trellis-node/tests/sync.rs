//! PBFT sync catch-up: a node starting k periods behind requests period
//! data from a peer, verifies each period's cert quorum, and converges on
//! the same head.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use libp2p::PeerId;
use trellis_core::types::{Address, U256};
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vrf::VrfKeyPair;
use trellis_net::packet::Packet;
use trellis_net::peer::{PeerConfig, PeerTable};
use trellis_net::router::{PacketRouter, RouterConfig, Transport};
use trellis_pool::AccountView;

/// Transport stub that records everything the router sends.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Packet>>,
}

impl Transport for RecordingTransport {
    fn send(&self, _peer: &PeerId, packet: Packet) {
        self.sent.lock().unwrap().push(packet);
    }
    fn broadcast(&self, packet: Packet) {
        self.sent.lock().unwrap().push(packet);
    }
    fn disconnect(&self, _peer: &PeerId) {}
}

struct ChainView(Arc<trellis_state::final_chain::FinalChain>);

impl AccountView for ChainView {
    fn account_nonce(&self, addr: &Address) -> u64 {
        self.0.account(addr).nonce
    }
    fn account_balance(&self, addr: &Address) -> U256 {
        self.0.account(addr).balance
    }
}

fn make_node(sender: &KeyPair) -> TestChain {
    let validator = KeyPair::from_secret_bytes(&[9u8; 32]).unwrap();
    let vrf = VrfKeyPair::from_seed(&[10u8; 32]);
    let genesis = single_validator_genesis(&validator, &vrf, &[(sender.address, 500_000)]);
    build_chain(genesis, validator, vrf)
}

#[test]
fn node_catches_up_k_periods_via_pbft_sync() {
    let sender = KeyPair::from_secret_bytes(&[5u8; 32]).unwrap();

    // Node A finalizes k = 3 periods, one transfer each.
    let node_a = make_node(&sender);
    let mut period_packets = Vec::new();
    for (period, nonce) in (1u64..=3).zip(0u64..) {
        let tx = signed_transfer(&sender, nonce, Address::repeat_byte(0xCC), 5, 1);
        let view = ChainView(Arc::clone(&node_a.final_chain));
        assert!(node_a.pool.insert(tx.clone(), &view).is_inserted());
        author_dag_block(&node_a, &[tx.hash()], 200 + period);
        let data = finalize_next_period(&node_a);
        period_packets.push(Packet::PbftSync {
            data: Box::new(data),
            remaining: 3 - period,
        });
    }
    assert_eq!(node_a.final_chain.head().period, 3);

    // Node B starts fresh from the same genesis and receives A's stream.
    let node_b = make_node(&sender);
    assert_eq!(node_b.final_chain.head().period, 0);
    let transport = Arc::new(RecordingTransport::default());
    let peers = Arc::new(PeerTable::new(PeerConfig::default()));
    let (votes_tx, _votes_rx) = tokio::sync::mpsc::channel(64);
    let (blocks_tx, _blocks_rx) = tokio::sync::mpsc::channel(64);
    let router = PacketRouter::new(
        RouterConfig {
            chain_id: CHAIN_ID,
            genesis_hash: node_b.genesis_hash,
            vdf: node_b.genesis.vdf_params(),
            sync_batch: 16,
        },
        peers,
        Arc::clone(&node_b.dag),
        Arc::clone(&node_b.pool),
        Arc::new(ChainView(Arc::clone(&node_b.final_chain))),
        Arc::clone(&node_b.final_chain),
        votes_tx,
        blocks_tx,
        transport.clone(),
    );

    let peer = PeerId::random();
    for packet in period_packets {
        router.handle(&peer, packet).unwrap();
    }

    let head_a = node_a.final_chain.head();
    let head_b = node_b.final_chain.head();
    assert_eq!(head_b.period, 3, "caught up all k periods");
    assert_eq!(head_b.state_root, head_a.state_root);
    assert_eq!(head_b.pbft_block_hash, head_a.pbft_block_hash);
}

#[test]
fn forged_cert_quorum_is_rejected() {
    let sender = KeyPair::from_secret_bytes(&[6u8; 32]).unwrap();
    let node_a = make_node(&sender);
    let tx = signed_transfer(&sender, 0, Address::repeat_byte(0xCC), 5, 1);
    let view = ChainView(Arc::clone(&node_a.final_chain));
    assert!(node_a.pool.insert(tx.clone(), &view).is_inserted());
    author_dag_block(&node_a, &[tx.hash()], 300);
    let mut data = finalize_next_period(&node_a);
    // Strip the cert votes: the quorum check must fail on the receiver.
    data.cert_votes.clear();

    let node_b = make_node(&sender);
    let transport = Arc::new(RecordingTransport::default());
    let peers = Arc::new(PeerTable::new(PeerConfig::default()));
    let (votes_tx, _votes_rx) = tokio::sync::mpsc::channel(64);
    let (blocks_tx, _blocks_rx) = tokio::sync::mpsc::channel(64);
    let router = PacketRouter::new(
        RouterConfig {
            chain_id: CHAIN_ID,
            genesis_hash: node_b.genesis_hash,
            vdf: node_b.genesis.vdf_params(),
            sync_batch: 16,
        },
        peers,
        Arc::clone(&node_b.dag),
        Arc::clone(&node_b.pool),
        Arc::new(ChainView(Arc::clone(&node_b.final_chain))),
        Arc::clone(&node_b.final_chain),
        votes_tx,
        blocks_tx,
        transport,
    );

    let peer = PeerId::random();
    let result = router.handle(
        &peer,
        Packet::PbftSync {
            data: Box::new(data),
            remaining: 0,
        },
    );
    assert!(result.is_err(), "unverifiable quorum must not commit");
    assert_eq!(node_b.final_chain.head().period, 0);
}
