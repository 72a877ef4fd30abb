use crate::config::Config;
use crate::core::{Block, Ledger, Transaction};
use crate::error::{NodeError, Result};
use crate::network::message::{
    send_message, version_compatible, HandshakeInfo, Message, PROTOCOL_VERSION,
};
use crate::network::{PeerRegistry, SeenCache};
use crate::utils::current_timestamp;
use log::{debug, error, info, warn};
use serde_json::Deserializer;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Blocks served per CHAIN response
const MAX_CHAIN_BATCH: u64 = 512;
/// Gossip keys remembered per cache
const SEEN_CACHE_CAPACITY: usize = 4096;
const TCP_READ_TIMEOUT_SECS: u64 = 60;

/// P2P server: accepts peer channels, dispatches their messages to the
/// ledger and peer registry, and gossips what this node accepts.
///
/// Within one channel messages reach the dispatcher in the order the peer
/// sent them. Gossip only happens after local acceptance, so peers never
/// observe a block this node has not itself committed.
pub struct Server {
    ledger: Arc<Ledger>,
    peers: Arc<PeerRegistry>,
    seen_transactions: Arc<Mutex<SeenCache>>,
    seen_blocks: Arc<Mutex<SeenCache>>,
    cancel_seal: Arc<AtomicBool>,
    config: Arc<Config>,
}

impl Clone for Server {
    fn clone(&self) -> Self {
        Server {
            ledger: Arc::clone(&self.ledger),
            peers: Arc::clone(&self.peers),
            seen_transactions: Arc::clone(&self.seen_transactions),
            seen_blocks: Arc::clone(&self.seen_blocks),
            cancel_seal: Arc::clone(&self.cancel_seal),
            config: Arc::clone(&self.config),
        }
    }
}

impl Server {
    pub fn new(
        ledger: Arc<Ledger>,
        peers: Arc<PeerRegistry>,
        cancel_seal: Arc<AtomicBool>,
        config: Arc<Config>,
    ) -> Server {
        Server {
            ledger,
            peers,
            seen_transactions: Arc::new(Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY))),
            seen_blocks: Arc::new(Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY))),
            cancel_seal,
            config,
        }
    }

    fn local_addr(&self) -> String {
        self.config.listen_addr()
    }

    fn handshake_info(&self) -> HandshakeInfo {
        let head = self.ledger.head();
        HandshakeInfo {
            addr_from: self.local_addr(),
            node_id: self.config.node_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            head_index: head.get_index(),
            head_hash: head.get_hash().to_string(),
        }
    }

    /// Bind the listener and serve peer channels until the process exits
    pub fn run(&self) -> Result<()> {
        let addr = self.local_addr();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| NodeError::Transport(format!("Failed to bind to {addr}: {e}")))?;

        info!("Peer server listening on {addr}");

        for peer_addr in &self.config.seed_peers {
            if let Err(e) = self.connect_to_peer(peer_addr) {
                warn!("Failed to contact seed peer {peer_addr}: {e}");
            }
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            debug!("Connection closed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }

        Ok(())
    }

    /// Read one channel's message stream and dispatch in arrival order
    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_secs(TCP_READ_TIMEOUT_SECS)))
            .map_err(|e| NodeError::Transport(format!("Failed to set read timeout: {e}")))?;

        let reader = BufReader::new(&stream);
        let messages = Deserializer::from_reader(reader).into_iter::<Message>();

        // Parse faults are attributed to the last peer that identified
        // itself on this channel; a fresh channel with garbage is just closed
        let mut channel_peer: Option<SocketAddr> = None;

        for message in messages {
            match message {
                Ok(message) => {
                    if let Ok(addr) = message.addr_from().parse() {
                        channel_peer = Some(addr);
                    }
                    if let Err(e) = self.process_message(message) {
                        error!("Error processing peer message: {e}");
                    }
                }
                Err(e) => {
                    warn!("Dropping malformed peer message: {e}");
                    if let Some(addr) = channel_peer {
                        self.peers.record_parse_fault(&addr);
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    fn process_message(&self, message: Message) -> Result<()> {
        debug!("Received {} from {}", message.tag(), message.addr_from());

        match message {
            Message::Hello(info) => self.handle_hello(info, true),
            Message::HelloAck(info) => self.handle_hello(info, false),
            Message::Ping {
                addr_from,
                timestamp,
            } => self.handle_ping(&addr_from, timestamp),
            Message::Pong { addr_from, .. } => self.handle_pong(&addr_from),
            Message::GetPeers { addr_from } => self.handle_get_peers(&addr_from),
            Message::Peers { peers, .. } => self.handle_peers(peers),
            Message::GetChain {
                addr_from,
                from_index,
                limit,
            } => self.handle_get_chain(&addr_from, from_index, limit),
            Message::Chain {
                addr_from, blocks, ..
            } => self.handle_chain(&addr_from, blocks),
            Message::NewTx {
                addr_from,
                transaction,
            } => self.handle_new_tx(&addr_from, &transaction),
            Message::NewBlock { addr_from, block } => self.handle_new_block(&addr_from, &block),
            Message::GetMempool { addr_from } => self.handle_get_mempool(&addr_from),
            Message::Mempool { transactions, .. } => self.handle_mempool(&transactions),
        }
    }

    // ---- handshake ----

    fn handle_hello(&self, info: HandshakeInfo, reply_with_ack: bool) -> Result<()> {
        if !version_compatible(&info.version) {
            warn!(
                "Dropping peer {} with incompatible version {}",
                info.addr_from, info.version
            );
            if let Ok(addr) = info.addr_from.parse() {
                self.peers.remove(&addr);
            }
            return Ok(());
        }

        let addr: SocketAddr = info
            .addr_from
            .parse()
            .map_err(|e| NodeError::Transport(format!("Invalid peer address: {e}")))?;
        let now = current_timestamp()?;

        if let Err(e) = self.peers.add_connecting(addr, now) {
            warn!("Not accepting peer {addr}: {e}");
            return Ok(());
        }
        self.peers.mark_ready(addr, &info.node_id, &info.version, now);

        if reply_with_ack {
            send_message(&info.addr_from, &Message::HelloAck(self.handshake_info()))?;
        }

        // Bootstrap: pull whatever the peer has that we do not
        if info.head_index + 1 > self.ledger.chain_len() {
            self.request_chain(&info.addr_from, self.ledger.chain_len(), MAX_CHAIN_BATCH)?;
        }
        send_message(
            &info.addr_from,
            &Message::GetMempool {
                addr_from: self.local_addr(),
            },
        )?;
        Ok(())
    }

    // ---- liveness ----

    fn handle_ping(&self, addr_from: &str, _timestamp: i64) -> Result<()> {
        if let Ok(addr) = addr_from.parse() {
            self.peers.touch(addr, current_timestamp()?);
        }
        send_message(
            addr_from,
            &Message::Pong {
                addr_from: self.local_addr(),
                timestamp: current_timestamp()?,
            },
        )
    }

    fn handle_pong(&self, addr_from: &str) -> Result<()> {
        if let Ok(addr) = addr_from.parse() {
            self.peers.touch(addr, current_timestamp()?);
        }
        Ok(())
    }

    /// Ping every ready peer and age the registry. Driven by the liveness
    /// ticker thread.
    pub fn liveness_tick(&self) {
        let now = match current_timestamp() {
            Ok(now) => now,
            Err(e) => {
                error!("Liveness tick skipped: {e}");
                return;
            }
        };

        for peer in self.peers.ready_peers() {
            let ping = Message::Ping {
                addr_from: self.local_addr(),
                timestamp: now,
            };
            if let Err(e) = send_message(&peer.to_string(), &ping) {
                debug!("Ping to {peer} failed: {e}");
            }
        }

        let interval_ms = (self.config.ping_interval_secs * 1_000) as i64;
        self.peers.age_peers(now, interval_ms);

        // Re-dial configured seeds that dropped out of the registry
        for seed in &self.config.seed_peers {
            let Ok(addr) = seed.parse::<SocketAddr>() else {
                continue;
            };
            if !self.peers.contains(&addr) {
                if let Err(e) = self.connect_to_peer(seed) {
                    debug!("Seed retry to {seed} failed: {e}");
                }
            }
        }
    }

    // ---- discovery ----

    fn handle_get_peers(&self, addr_from: &str) -> Result<()> {
        send_message(
            addr_from,
            &Message::Peers {
                addr_from: self.local_addr(),
                peers: self.peers.snapshot(),
            },
        )
    }

    fn handle_peers(&self, peers: Vec<crate::network::message::PeerInfo>) -> Result<()> {
        for info in peers {
            let Ok(addr) = info.address.parse::<SocketAddr>() else {
                continue;
            };
            if info.address != self.local_addr() && !self.peers.contains(&addr) {
                if let Err(e) = self.connect_to_peer(&info.address) {
                    debug!("Discovery dial to {} failed: {e}", info.address);
                }
            }
        }
        Ok(())
    }

    /// Dial a peer and open the handshake. A failed dial leaves no entry
    /// behind, so the next retry cycle starts clean.
    pub fn connect_to_peer(&self, addr: &str) -> Result<()> {
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| NodeError::Transport(format!("Invalid peer address {addr}: {e}")))?;
        self.peers.add_connecting(socket_addr, current_timestamp()?)?;
        if let Err(e) = send_message(addr, &Message::Hello(self.handshake_info())) {
            self.peers.remove(&socket_addr);
            return Err(e);
        }
        Ok(())
    }

    // ---- chain synchronization ----

    fn request_chain(&self, peer: &str, from_index: u64, limit: u64) -> Result<()> {
        send_message(
            peer,
            &Message::GetChain {
                addr_from: self.local_addr(),
                from_index,
                limit,
            },
        )
    }

    fn handle_get_chain(&self, addr_from: &str, from_index: u64, limit: u64) -> Result<()> {
        let blocks = self
            .ledger
            .blocks_range(from_index, limit.min(MAX_CHAIN_BATCH) as usize);
        let mut encoded = Vec::with_capacity(blocks.len());
        for block in &blocks {
            encoded.push(block.serialize()?);
        }
        send_message(
            addr_from,
            &Message::Chain {
                addr_from: self.local_addr(),
                from_index,
                blocks: encoded,
            },
        )
    }

    /// A range response: either it extends the head directly, or it is a
    /// fork candidate for the ledger's reorg path. When reconciliation
    /// fails, the backtrack doubles until the configured bound, then the
    /// peer's claim is abandoned.
    fn handle_chain(&self, addr_from: &str, encoded: Vec<Vec<u8>>) -> Result<()> {
        if encoded.is_empty() {
            return Ok(());
        }

        let mut blocks = Vec::with_capacity(encoded.len());
        for bytes in &encoded {
            match Block::deserialize(bytes) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    if let Ok(addr) = addr_from.parse() {
                        self.peers.record_parse_fault(&addr);
                    }
                    return Err(NodeError::Transport(format!(
                        "undecodable block in CHAIN response: {e}"
                    )));
                }
            }
        }

        for block in &blocks {
            self.note_block_seen(block.get_hash());
        }

        let head = self.ledger.head();
        let peer_addr: Option<SocketAddr> = addr_from.parse().ok();
        let mut advanced = false;

        if blocks[0].get_previous_hash() == head.get_hash() {
            for block in blocks {
                match self.ledger.append_block(block) {
                    Ok(()) => advanced = true,
                    Err(e) => {
                        debug!("Stopped applying CHAIN response: {e}");
                        break;
                    }
                }
            }
        } else {
            match self.ledger.try_reorg(&blocks) {
                Ok(()) => advanced = true,
                Err(e) => {
                    debug!("Reorg attempt from {addr_from} failed: {e}");
                    if let Some(addr) = peer_addr {
                        self.escalate_backtrack(&addr, addr_from)?;
                    }
                }
            }
        }

        if advanced {
            if let Some(addr) = peer_addr {
                self.peers.set_backtrack(&addr, 0);
            }
            self.cancel_seal.store(true, Ordering::Relaxed);
            info!("Chain advanced to {} via {addr_from}", self.ledger.chain_len() - 1);
        }
        Ok(())
    }

    fn escalate_backtrack(&self, addr: &SocketAddr, addr_from: &str) -> Result<()> {
        let current = self.peers.get_backtrack(addr);
        let next = if current == 0 {
            self.config.backtrack_window
        } else {
            current.saturating_mul(2)
        };

        if next > self.config.max_backtrack {
            warn!("Abandoning chain claim from {addr_from} after backtrack {current}");
            self.peers.set_backtrack(addr, 0);
            self.peers.record_consensus_fault(addr);
            return Ok(());
        }

        self.peers.set_backtrack(addr, next);
        let from_index = self.ledger.head().get_index().saturating_sub(next);
        debug!("Backtracking to {from_index} with window {next} via {addr_from}");
        self.request_chain(addr_from, from_index, MAX_CHAIN_BATCH)
    }

    // ---- gossip ----

    fn handle_new_tx(&self, addr_from: &str, encoded: &[u8]) -> Result<()> {
        let tx = match Transaction::deserialize(encoded) {
            Ok(tx) => tx,
            Err(e) => {
                if let Ok(addr) = addr_from.parse() {
                    self.peers.record_parse_fault(&addr);
                }
                return Err(NodeError::Transport(format!(
                    "undecodable transaction: {e}"
                )));
            }
        };

        // Duplicate receipts are accepted but not forwarded
        if !self.note_tx_seen(&tx.id_hex()) {
            return Ok(());
        }

        match self.ledger.submit_transaction(tx.clone()) {
            Ok(()) => self.broadcast_transaction(&tx, Some(addr_from)),
            Err(e) if e.is_validation() => {
                debug!("Gossiped transaction rejected: {e}");
                Ok(())
            }
            Err(e) => {
                warn!("Gossiped transaction not admitted: {e}");
                Ok(())
            }
        }
    }

    fn handle_new_block(&self, addr_from: &str, encoded: &[u8]) -> Result<()> {
        let block = match Block::deserialize(encoded) {
            Ok(block) => block,
            Err(e) => {
                if let Ok(addr) = addr_from.parse() {
                    self.peers.record_parse_fault(&addr);
                }
                return Err(NodeError::Transport(format!("undecodable block: {e}")));
            }
        };

        if !self.note_block_seen(block.get_hash()) {
            return Ok(());
        }

        let head = self.ledger.head();
        let peer_addr: Option<SocketAddr> = addr_from.parse().ok();

        if block.get_previous_hash() == head.get_hash() {
            let index = block.get_index();
            match self.ledger.append_block(block.clone()) {
                Ok(()) => {
                    // The miner is now sealing on a stale parent
                    self.cancel_seal.store(true, Ordering::Relaxed);
                    info!("Accepted gossiped block {index} from {addr_from}");
                    self.broadcast_block(&block, Some(addr_from))?;
                }
                Err(e) => {
                    warn!("Rejected gossiped block {index} from {addr_from}: {e}");
                    if let (Some(addr), NodeError::Consensus(_)) = (peer_addr, &e) {
                        self.peers.record_consensus_fault(&addr);
                    }
                }
            }
        } else if block.get_index() > head.get_index() {
            // Ahead of us on an unknown parent: reconcile via backtrack
            if let Some(addr) = peer_addr {
                self.peers.set_backtrack(&addr, self.config.backtrack_window);
            }
            let from_index = head
                .get_index()
                .saturating_sub(self.config.backtrack_window);
            self.request_chain(addr_from, from_index, MAX_CHAIN_BATCH)?;
        } else {
            debug!(
                "Ignoring stale block {} (head at {})",
                block.get_index(),
                head.get_index()
            );
        }
        Ok(())
    }

    fn handle_get_mempool(&self, addr_from: &str) -> Result<()> {
        let mut encoded = Vec::new();
        for tx in self.ledger.mempool_snapshot() {
            encoded.push(tx.serialize()?);
        }
        send_message(
            addr_from,
            &Message::Mempool {
                addr_from: self.local_addr(),
                transactions: encoded,
            },
        )
    }

    fn handle_mempool(&self, encoded: &[Vec<u8>]) -> Result<()> {
        for bytes in encoded {
            let Ok(tx) = Transaction::deserialize(bytes) else {
                continue;
            };
            self.note_tx_seen(&tx.id_hex());
            if let Err(e) = self.ledger.submit_transaction(tx) {
                debug!("Bootstrap transaction not admitted: {e}");
            }
        }
        Ok(())
    }

    /// Forward a locally-accepted transaction to every ready peer but the
    /// source
    pub fn broadcast_transaction(&self, tx: &Transaction, exclude: Option<&str>) -> Result<()> {
        self.note_tx_seen(&tx.id_hex());
        let message = Message::NewTx {
            addr_from: self.local_addr(),
            transaction: tx.serialize()?,
        };
        self.broadcast(&message, exclude);
        Ok(())
    }

    /// Forward a locally-accepted block to every ready peer but the source
    pub fn broadcast_block(&self, block: &Block, exclude: Option<&str>) -> Result<()> {
        self.note_block_seen(block.get_hash());
        let message = Message::NewBlock {
            addr_from: self.local_addr(),
            block: block.serialize()?,
        };
        self.broadcast(&message, exclude);
        Ok(())
    }

    fn broadcast(&self, message: &Message, exclude: Option<&str>) {
        for peer in self.peers.ready_peers() {
            let peer_str = peer.to_string();
            if Some(peer_str.as_str()) == exclude {
                continue;
            }
            if let Err(e) = send_message(&peer_str, message) {
                debug!("Broadcast of {} to {peer_str} failed: {e}", message.tag());
            }
        }
    }

    fn note_tx_seen(&self, txid_hex: &str) -> bool {
        self.seen_transactions
            .lock()
            .expect("Failed to acquire lock on seen transactions - this should never happen")
            .insert(txid_hex)
    }

    fn note_block_seen(&self, hash: &str) -> bool {
        self.seen_blocks
            .lock()
            .expect("Failed to acquire lock on seen blocks - this should never happen")
            .insert(hash)
    }
}
