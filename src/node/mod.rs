//! Node assembly
//!
//! Wires the ledger, consensus engine, and peer layer together and drives
//! the long-running tasks: the peer server, the miner, and the liveness
//! ticker. The public methods here are the surface an API collaborator
//! maps onto 1:1.

use crate::config::Config;
use crate::consensus::{ConsensusEngine, Validator};
use crate::core::{Block, Ledger, LedgerParams, Transaction, TransactionBuilder};
use crate::error::{NodeError, Result};
use crate::network::{PeerInfo, PeerRegistry, Server};
use crate::storage::ChainStore;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAX_PEERS: usize = 64;
/// Miner idle wait between checks for eligible work
const MINER_IDLE_MS: u64 = 250;
/// Pause after a failed sealing attempt (budget exhausted, draw lost)
const MINER_RETRY_MS: u64 = 100;

/// Snapshot served to status queries
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub head_index: u64,
    pub head_hash: String,
    pub difficulty: u32,
    pub mempool_size: usize,
    pub peer_count: usize,
    pub is_mining: bool,
}

pub struct Node {
    ledger: Arc<Ledger>,
    peers: Arc<PeerRegistry>,
    server: Server,
    cancel_seal: Arc<AtomicBool>,
    mining: Arc<AtomicBool>,
    config: Arc<Config>,
}

impl Node {
    pub fn new(config: Config) -> Result<Node> {
        config.validate()?;

        let store = match &config.data_dir {
            Some(dir) => Some(ChainStore::open(&Path::new(dir).join("chain"))?),
            None => None,
        };

        let engine = ConsensusEngine::new(
            config.consensus_mode,
            config.pow_weight,
            config.sealing_budget,
        );
        let params = LedgerParams::from(&config);

        let ledger = Arc::new(Ledger::new(params, engine, store)?);
        let peers = Arc::new(PeerRegistry::new(MAX_PEERS));
        let cancel_seal = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);
        let server = Server::new(
            Arc::clone(&ledger),
            Arc::clone(&peers),
            Arc::clone(&cancel_seal),
            Arc::clone(&config),
        );

        Ok(Node {
            ledger,
            peers,
            server,
            cancel_seal,
            mining: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Spawn the background tasks and serve peer channels on this thread.
    /// Only returns when the listener fails.
    pub fn run(&self) -> Result<()> {
        info!(
            "Starting node {} on {}",
            self.config.node_id,
            self.config.listen_addr()
        );

        self.spawn_liveness_ticker();

        if self.config.mining_enabled {
            self.start_mining()?;
        }
        self.spawn_miner();

        self.server.run()
    }

    fn spawn_liveness_ticker(&self) {
        let server = self.server.clone();
        let interval = Duration::from_secs(self.config.ping_interval_secs);
        thread::spawn(move || loop {
            thread::sleep(interval);
            server.liveness_tick();
        });
    }

    /// The mining loop: wait for eligible work, assemble, seal, append,
    /// gossip. A peer block that advances the head flips the cancel flag
    /// and the in-progress attempt is abandoned in favor of the new head.
    fn spawn_miner(&self) {
        let ledger = Arc::clone(&self.ledger);
        let server = self.server.clone();
        let mining = Arc::clone(&self.mining);
        let cancel = Arc::clone(&self.cancel_seal);
        let engine = ConsensusEngine::new(
            self.config.consensus_mode,
            self.config.pow_weight,
            self.config.sealing_budget,
        );
        let miner_address = self.config.miner_address.clone().unwrap_or_default();

        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            loop {
                if !mining.load(Ordering::Relaxed) || miner_address.is_empty() {
                    thread::sleep(Duration::from_millis(MINER_IDLE_MS));
                    continue;
                }
                if !ledger.has_eligible_work() {
                    thread::sleep(Duration::from_millis(MINER_IDLE_MS));
                    continue;
                }

                cancel.store(false, Ordering::Relaxed);
                let mut block = match ledger.assemble_block(&miner_address) {
                    Ok(block) => block,
                    Err(NodeError::Resource(_)) => {
                        thread::sleep(Duration::from_millis(MINER_IDLE_MS));
                        continue;
                    }
                    Err(e) => {
                        error!("Block assembly failed: {e}");
                        thread::sleep(Duration::from_millis(MINER_RETRY_MS));
                        continue;
                    }
                };

                let registry = ledger.registry_snapshot();
                match engine.seal(&mut block, &registry, &miner_address, &cancel, &mut rng) {
                    Ok(()) => {}
                    Err(NodeError::Resource(reason)) => {
                        // Lost the proposer draw, ran out of budget, or a
                        // peer block superseded this attempt
                        debug!("Sealing attempt abandoned: {reason}");
                        thread::sleep(Duration::from_millis(MINER_RETRY_MS));
                        continue;
                    }
                    Err(e) => {
                        warn!("Sealing failed: {e}");
                        thread::sleep(Duration::from_millis(MINER_RETRY_MS));
                        continue;
                    }
                }

                match ledger.append_block(block.clone()) {
                    Ok(()) => {
                        info!(
                            "Mined block {} ({}) via {}",
                            block.get_index(),
                            block.get_hash(),
                            block.get_consensus_tag()
                        );
                        if let Err(e) = server.broadcast_block(&block, None) {
                            warn!("Broadcast of mined block failed: {e}");
                        }
                    }
                    Err(e) => {
                        // A gossiped block beat us to this height
                        debug!("Discarding mined block {}: {e}", block.get_index());
                    }
                }
            }
        });
    }

    // ---- API surface ----

    /// Validate, admit, and gossip a client transaction
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        self.ledger.submit_transaction(tx.clone())?;
        // Gossip strictly after local acceptance
        self.server.broadcast_transaction(&tx, None)?;
        Ok(())
    }

    /// Collect a signature on a pending multi-sig transaction
    pub fn add_signature(&self, txid_hex: &str, signer: &str, signature: Vec<u8>) -> Result<()> {
        self.ledger.add_signature(txid_hex, signer, signature)
    }

    /// Build, admit, and gossip a stake registration for `from`
    pub fn register_stake(&self, from: &str, amount: u64, fee: u64) -> Result<Transaction> {
        let tx = TransactionBuilder::standard(
            from,
            &self.config.stake_pool_address,
            amount,
            fee,
        )?;
        self.submit_transaction(tx.clone())?;
        Ok(tx)
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.ledger.balance(address)
    }

    pub fn head(&self) -> Block {
        self.ledger.head()
    }

    pub fn block_at(&self, index: u64) -> Result<Block> {
        self.ledger
            .block_at(index)
            .ok_or_else(|| NodeError::NotFound(format!("no block at index {index}")))
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Block> {
        self.ledger
            .block_by_hash(hash)
            .ok_or_else(|| NodeError::NotFound(format!("no block with hash {hash}")))
    }

    pub fn mempool(&self) -> Vec<Transaction> {
        self.ledger.mempool_snapshot()
    }

    pub fn validators(&self) -> Vec<Validator> {
        self.ledger.validators_snapshot()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.snapshot()
    }

    /// Dial a peer and open the handshake
    pub fn add_peer(&self, addr: &str) -> Result<()> {
        self.server.connect_to_peer(addr)
    }

    pub fn remove_peer(&self, addr: &str) -> Result<()> {
        let socket_addr = addr
            .parse()
            .map_err(|e| NodeError::Validation(format!("invalid peer address {addr}: {e}")))?;
        self.peers.remove(&socket_addr);
        Ok(())
    }

    pub fn start_mining(&self) -> Result<()> {
        if self.config.miner_address.is_none() {
            return Err(NodeError::Config(
                "cannot mine without miner_address".to_string(),
            ));
        }
        self.mining.store(true, Ordering::Relaxed);
        info!("Mining enabled");
        Ok(())
    }

    pub fn stop_mining(&self) {
        self.mining.store(false, Ordering::Relaxed);
        info!("Mining disabled");
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> NodeStatus {
        let head = self.ledger.head();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            head_index: head.get_index(),
            head_hash: head.get_hash().to_string(),
            difficulty: head.get_difficulty(),
            mempool_size: self.ledger.mempool_len(),
            peer_count: self.peers.len(),
            is_mining: self.is_mining(),
        }
    }
}
