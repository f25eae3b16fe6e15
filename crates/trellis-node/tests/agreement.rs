//! Two honest nodes with identical genesis receive the same finalized
//! period and must land on identical state roots and block hashes.

mod common;

use common::*;
use trellis_core::types::Address;
use trellis_crypto::ecdsa::KeyPair;
use trellis_crypto::vrf::VrfKeyPair;
use trellis_pool::AccountView;
use trellis_core::types::U256;

struct View<'a>(&'a TestChain);

impl AccountView for View<'_> {
    fn account_nonce(&self, addr: &Address) -> u64 {
        self.0.final_chain.account(addr).nonce
    }
    fn account_balance(&self, addr: &Address) -> U256 {
        self.0.final_chain.account(addr).balance
    }
}

fn make_node(sender: &KeyPair) -> TestChain {
    // Both nodes share the validator identity in config terms: same stake
    // table, same genesis hash. (A real deployment has distinct node keys;
    // state agreement only depends on the executed inputs.)
    let validator = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
    let vrf = VrfKeyPair::from_seed(&[8u8; 32]);
    let genesis = single_validator_genesis(&validator, &vrf, &[(sender.address, 500_000)]);
    build_chain(genesis, validator, vrf)
}

#[test]
fn identical_periods_produce_identical_heads() {
    let sender = KeyPair::from_secret_bytes(&[3u8; 32]).unwrap();
    let node_a = make_node(&sender);
    let node_b = make_node(&sender);
    assert_eq!(node_a.genesis_hash, node_b.genesis_hash);

    // The same transaction reaches both pools.
    let tx = signed_transfer(&sender, 0, Address::repeat_byte(0xCC), 42, 2);
    assert!(node_a.pool.insert(tx.clone(), &View(&node_a)).is_inserted());
    assert!(node_b.pool.insert(tx.clone(), &View(&node_b)).is_inserted());

    // Identical DAG content on both sides (same author key, same inputs,
    // identical block hashes).
    author_dag_block(&node_a, &[tx.hash()], 100);
    author_dag_block(&node_b, &[tx.hash()], 100);

    let data_a = finalize_next_period(&node_a);
    let data_b = finalize_next_period(&node_b);

    let head_a = node_a.final_chain.head();
    let head_b = node_b.final_chain.head();
    assert_eq!(head_a.period, 1);
    assert_eq!(head_a.state_root, head_b.state_root, "state roots agree");
    assert_eq!(
        head_a.pbft_block_hash, head_b.pbft_block_hash,
        "finalized block hashes agree"
    );
    assert_eq!(data_a.header.hash(), data_b.header.hash(), "headers agree");
    assert_eq!(data_a.header.state_root, head_a.state_root);
}

#[test]
fn agreement_holds_over_multiple_periods() {
    let sender = KeyPair::from_secret_bytes(&[4u8; 32]).unwrap();
    let node_a = make_node(&sender);
    let node_b = make_node(&sender);

    for (period, nonce) in (1u64..=3).zip(0u64..) {
        let tx = signed_transfer(&sender, nonce, Address::repeat_byte(0xCC), 10, 1);
        assert!(node_a.pool.insert(tx.clone(), &View(&node_a)).is_inserted());
        assert!(node_b.pool.insert(tx.clone(), &View(&node_b)).is_inserted());
        author_dag_block(&node_a, &[tx.hash()], 100 + period);
        author_dag_block(&node_b, &[tx.hash()], 100 + period);
        finalize_next_period(&node_a);
        finalize_next_period(&node_b);
        assert_eq!(
            node_a.final_chain.head().state_root,
            node_b.final_chain.head().state_root,
            "state diverged at period {period}"
        );
    }
    assert_eq!(node_a.final_chain.head().period, 3);
}
