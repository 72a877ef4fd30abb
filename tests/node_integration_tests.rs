//! Node integration tests
//!
//! Exercises the ledger, consensus engines, and the peer layer through the
//! public API: single-node transfer scenarios, time-lock and multi-sig
//! gating, persistence replay, and two live nodes gossiping over loopback.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_chain::{
    current_timestamp, Block, Config, ConsensusEngine, ConsensusMode, Ledger, LedgerParams, Node,
    NodeError, ProofOfWork, TransactionBuilder,
};
use tempfile::tempdir;

const MINER: &str = "miner";

fn test_params(allocations: &[(&str, u64)]) -> LedgerParams {
    let mut genesis_allocations = BTreeMap::new();
    for (address, amount) in allocations {
        genesis_allocations.insert(address.to_string(), *amount);
    }
    LedgerParams {
        initial_difficulty: 1,
        genesis_allocations,
        ..LedgerParams::default()
    }
}

fn pow_engine() -> ConsensusEngine {
    ConsensusEngine::new(ConsensusMode::Pow, 1.0, 10_000_000)
}

fn funded_ledger(allocations: &[(&str, u64)]) -> Ledger {
    Ledger::new(test_params(allocations), pow_engine(), None).unwrap()
}

fn mine_once(ledger: &Ledger) -> Block {
    let mut block = ledger.assemble_block(MINER).unwrap();
    let registry = ledger.registry_snapshot();
    let cancel = AtomicBool::new(false);
    let mut rng = rand::thread_rng();
    pow_engine()
        .seal(&mut block, &registry, MINER, &cancel, &mut rng)
        .unwrap();
    ledger.append_block(block.clone()).unwrap();
    block
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn test_single_node_standard_transfer() {
    let ledger = funded_ledger(&[("alice", 100)]);

    ledger
        .submit_transaction(TransactionBuilder::standard("alice", "bob", 40, 1).unwrap())
        .unwrap();
    let block = mine_once(&ledger);

    assert_eq!(ledger.chain_len(), 2);
    assert_eq!(ledger.balance("alice"), 59);
    assert_eq!(ledger.balance("bob"), 40);
    assert!(ledger.balance(MINER) > 1); // fee plus base reward
    assert!(ledger.mempool_snapshot().is_empty());
    assert!(ProofOfWork::validate(&block));
    assert!(block.verify_merkle_root().unwrap());
}

#[test]
fn test_insufficient_funds_leaves_mempool_unchanged() {
    let ledger = funded_ledger(&[("alice", 100)]);
    ledger
        .submit_transaction(TransactionBuilder::standard("alice", "bob", 40, 1).unwrap())
        .unwrap();
    mine_once(&ledger);

    // 59 left: a 100 + 1 transfer cannot be funded
    let result =
        ledger.submit_transaction(TransactionBuilder::standard("alice", "bob", 100, 1).unwrap());
    assert!(matches!(result, Err(NodeError::InsufficientFunds { .. })));
    assert!(ledger.mempool_snapshot().is_empty());
}

#[test]
fn test_chain_invariants_hold_over_many_blocks() {
    let ledger = funded_ledger(&[("alice", 1_000)]);

    for i in 0..5u64 {
        ledger
            .submit_transaction(
                TransactionBuilder::standard("alice", &format!("peer-{i}"), 10, 1).unwrap(),
            )
            .unwrap();
        mine_once(&ledger);
    }

    for index in 1..ledger.chain_len() {
        let block = ledger.block_at(index).unwrap();
        let parent = ledger.block_at(index - 1).unwrap();
        assert_eq!(block.get_previous_hash(), parent.get_hash());
        assert_eq!(block.get_index(), index);
        assert!(block.verify_merkle_root().unwrap());
        assert!(ProofOfWork::validate(&block));
    }
}

#[test]
fn test_time_locked_held_until_unlock() {
    let ledger = funded_ledger(&[("alice", 100)]);
    let unlock_time = current_timestamp().unwrap() + 1_500;

    ledger
        .submit_transaction(
            TransactionBuilder::time_locked("alice", "bob", 10, 1, unlock_time).unwrap(),
        )
        .unwrap();

    // Still locked: nothing to assemble
    assert!(ledger.assemble_block(MINER).is_err());
    assert_eq!(ledger.mempool_snapshot().len(), 1);

    thread::sleep(Duration::from_millis(1_600));

    mine_once(&ledger);
    assert_eq!(ledger.balance("bob"), 10);
    assert!(ledger.mempool_snapshot().is_empty());
}

#[test]
fn test_multisig_two_signature_progression() {
    let ledger = funded_ledger(&[("alice", 100), ("bob", 100)]);
    let tx = TransactionBuilder::multi_sig(
        vec!["alice".to_string(), "bob".to_string()],
        "carol",
        30,
        1,
        2,
    )
    .unwrap();
    let txid = tx.id_hex();
    ledger.submit_transaction(tx).unwrap();

    ledger.add_signature(&txid, "alice", vec![1]).unwrap();
    assert!(ledger.assemble_block(MINER).is_err());

    ledger.add_signature(&txid, "bob", vec![2]).unwrap();
    mine_once(&ledger);

    assert_eq!(ledger.balance("carol"), 30);
    // Included exactly once: resubmission is a duplicate
    let result = ledger.add_signature(&txid, "alice", vec![1]);
    assert!(result.is_err());
}

#[test]
fn test_mempool_capacity_evicts_lowest_fee() {
    let params = LedgerParams {
        mempool_capacity: 3,
        ..test_params(&[("alice", 10_000)])
    };
    let ledger = Ledger::new(params, pow_engine(), None).unwrap();

    let mut ids = Vec::new();
    for fee in [5u64, 3, 8, 6] {
        let tx = TransactionBuilder::standard("alice", &format!("r{fee}"), 1, fee).unwrap();
        ids.push((fee, tx.id_hex()));
        ledger.submit_transaction(tx).unwrap();
    }

    let pool = ledger.mempool_snapshot();
    assert_eq!(pool.len(), 3);
    let lowest = &ids.iter().find(|(fee, _)| *fee == 3).unwrap().1;
    assert!(!pool.iter().any(|tx| &tx.id_hex() == lowest));
}

#[test]
fn test_chain_store_replay_restores_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain");
    let params = test_params(&[("alice", 100)]);

    {
        let store = tandem_chain::ChainStore::open(&path).unwrap();
        let ledger = Ledger::new(params.clone(), pow_engine(), Some(store)).unwrap();
        ledger
            .submit_transaction(TransactionBuilder::standard("alice", "bob", 25, 1).unwrap())
            .unwrap();
        mine_once(&ledger);
        assert_eq!(ledger.chain_len(), 2);
    }

    // A fresh ledger over the same store replays to identical state
    let store = tandem_chain::ChainStore::open(&path).unwrap();
    let restored = Ledger::new(params, pow_engine(), Some(store)).unwrap();
    assert_eq!(restored.chain_len(), 2);
    assert_eq!(restored.balance("alice"), 74);
    assert_eq!(restored.balance("bob"), 25);
}

#[test]
fn test_pos_block_production_with_staked_validator() {
    // Hybrid verification accepts both tags; sealing below picks each
    // engine explicitly
    let hybrid = ConsensusEngine::new(ConsensusMode::Hybrid, 1.0, 10_000_000);
    let ledger = Ledger::new(test_params(&[(MINER, 50_000)]), hybrid, None).unwrap();

    // Stake enough to become the sole active validator
    ledger
        .submit_transaction(TransactionBuilder::standard(MINER, "stakepool", 10_000, 1).unwrap())
        .unwrap();
    mine_once(&ledger);
    assert!(ledger.registry_snapshot().is_active(MINER));

    // Now seal a block under pure proof-of-stake
    let pos_engine = ConsensusEngine::new(ConsensusMode::Pos, 0.0, 10_000_000);
    ledger
        .submit_transaction(TransactionBuilder::standard(MINER, "bob", 5, 1).unwrap())
        .unwrap();
    let mut block = ledger.assemble_block(MINER).unwrap();
    let registry = ledger.registry_snapshot();
    let cancel = AtomicBool::new(false);
    let mut rng = rand::thread_rng();
    pos_engine
        .seal(&mut block, &registry, MINER, &cancel, &mut rng)
        .unwrap();
    ledger.append_block(block).unwrap();

    assert_eq!(ledger.balance("bob"), 5);
}

// ---- two-node loopback network ----

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_listener(port: u16) {
    assert!(
        wait_until(Duration::from_secs(10), || {
            std::net::TcpStream::connect(("127.0.0.1", port)).is_ok()
        }),
        "node never bound port {port}"
    );
}

fn node_config(port: u16, seed: Option<u16>, mine: bool) -> Config {
    let mut genesis_allocations = BTreeMap::new();
    genesis_allocations.insert("alice".to_string(), 1_000);

    Config {
        node_id: format!("test-node-{port}"),
        listen_address: "127.0.0.1".to_string(),
        listen_port: port,
        seed_peers: seed
            .map(|p| vec![format!("127.0.0.1:{p}")])
            .unwrap_or_default(),
        initial_difficulty: 1,
        consensus_mode: ConsensusMode::Pow,
        pow_weight: 1.0,
        pos_weight: 0.0,
        mining_enabled: mine,
        miner_address: mine.then(|| MINER.to_string()),
        ping_interval_secs: 1,
        genesis_allocations,
        ..Config::default()
    }
}

#[test]
fn test_two_node_handshake_and_block_gossip() {
    let port1 = free_port();
    let port2 = free_port();

    let node1 = Arc::new(Node::new(node_config(port1, None, true)).unwrap());
    let node2 = Arc::new(Node::new(node_config(port2, Some(port1), false)).unwrap());

    {
        let node = Arc::clone(&node1);
        thread::spawn(move || {
            let _ = node.run();
        });
    }
    wait_for_listener(port1);
    {
        let node = Arc::clone(&node2);
        thread::spawn(move || {
            let _ = node.run();
        });
    }
    wait_for_listener(port2);

    // Handshake completes in both directions
    assert!(
        wait_until(Duration::from_secs(10), || {
            !node1.peers().is_empty() && !node2.peers().is_empty()
        }),
        "handshake did not complete"
    );

    // A transaction submitted to the mining node becomes a block everywhere
    node1
        .submit_transaction(TransactionBuilder::standard("alice", "bob", 40, 1).unwrap())
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || {
            node1.head().get_index() >= 1 && node2.head().get_index() >= 1
        }),
        "block did not propagate"
    );
    assert_eq!(node1.head().get_hash(), node2.head().get_hash());
    assert_eq!(node2.balance("bob"), 40);
    assert!(wait_until(Duration::from_secs(5), || {
        node1.mempool().is_empty() && node2.mempool().is_empty()
    }));
}

#[test]
fn test_transaction_gossip_reaches_peer_mempool() {
    let port1 = free_port();
    let port2 = free_port();

    // Neither node mines: the transaction must sit in both mempools
    let node1 = Arc::new(Node::new(node_config(port1, None, false)).unwrap());
    let node2 = Arc::new(Node::new(node_config(port2, Some(port1), false)).unwrap());

    {
        let node = Arc::clone(&node1);
        thread::spawn(move || {
            let _ = node.run();
        });
    }
    wait_for_listener(port1);
    {
        let node = Arc::clone(&node2);
        thread::spawn(move || {
            let _ = node.run();
        });
    }
    wait_for_listener(port2);

    assert!(wait_until(Duration::from_secs(10), || {
        !node1.peers().is_empty() && !node2.peers().is_empty()
    }));

    let tx = TransactionBuilder::standard("alice", "bob", 10, 1).unwrap();
    node2.submit_transaction(tx.clone()).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            node1.mempool().iter().any(|t| t.get_id() == tx.get_id())
        }),
        "transaction did not reach the peer mempool"
    );
}
