use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Protocol version advertised in the handshake; peers must share the major
pub const PROTOCOL_VERSION: &str = "1.0.0";

const TCP_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Peers speaking a different major version are dropped at handshake
pub fn version_compatible(version: &str) -> bool {
    let ours = PROTOCOL_VERSION.split('.').next().unwrap_or("");
    let theirs = version.split('.').next().unwrap_or("x");
    ours == theirs
}

/// Handshake payload carried by Hello and HelloAck
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub addr_from: String,
    pub node_id: String,
    pub version: String,
    pub head_index: u64,
    pub head_hash: String,
}

/// Peer descriptor exchanged during discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub node_id: Option<String>,
    pub version: Option<String>,
    pub last_seen: i64,
}

/// P2P message envelope
///
/// Envelopes travel as a serde_json stream over TCP, which is deterministic
/// and self-delimiting. Blocks and transactions inside them are canonical
/// bytes, the same encoding used for fingerprinting. Every message names the
/// sender's listen address so replies can be dialed back.
#[derive(Debug, Serialize, Deserialize)]
pub enum Message {
    Hello(HandshakeInfo),
    HelloAck(HandshakeInfo),
    Ping {
        addr_from: String,
        timestamp: i64,
    },
    Pong {
        addr_from: String,
        timestamp: i64,
    },
    GetPeers {
        addr_from: String,
    },
    Peers {
        addr_from: String,
        peers: Vec<PeerInfo>,
    },
    GetChain {
        addr_from: String,
        from_index: u64,
        limit: u64,
    },
    Chain {
        addr_from: String,
        from_index: u64,
        blocks: Vec<Vec<u8>>,
    },
    NewTx {
        addr_from: String,
        transaction: Vec<u8>,
    },
    NewBlock {
        addr_from: String,
        block: Vec<u8>,
    },
    GetMempool {
        addr_from: String,
    },
    Mempool {
        addr_from: String,
        transactions: Vec<Vec<u8>>,
    },
}

impl Message {
    /// The sender's advertised listen address
    pub fn addr_from(&self) -> &str {
        match self {
            Message::Hello(info) | Message::HelloAck(info) => &info.addr_from,
            Message::Ping { addr_from, .. }
            | Message::Pong { addr_from, .. }
            | Message::GetPeers { addr_from }
            | Message::Peers { addr_from, .. }
            | Message::GetChain { addr_from, .. }
            | Message::Chain { addr_from, .. }
            | Message::NewTx { addr_from, .. }
            | Message::NewBlock { addr_from, .. }
            | Message::GetMempool { addr_from }
            | Message::Mempool { addr_from, .. } => addr_from,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::HelloAck(_) => "HELLO_ACK",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::GetPeers { .. } => "GET_PEERS",
            Message::Peers { .. } => "PEERS",
            Message::GetChain { .. } => "GET_CHAIN",
            Message::Chain { .. } => "CHAIN",
            Message::NewTx { .. } => "NEW_TX",
            Message::NewBlock { .. } => "NEW_BLOCK",
            Message::GetMempool { .. } => "GET_MEMPOOL",
            Message::Mempool { .. } => "MEMPOOL",
        }
    }
}

/// Dial a peer and write one message
pub fn send_message(addr: &str, message: &Message) -> Result<()> {
    let socket_addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| NodeError::Transport(format!("Invalid address {addr}: {e}")))?;

    let mut stream =
        TcpStream::connect_timeout(&socket_addr, Duration::from_millis(TCP_WRITE_TIMEOUT_MS))
            .map_err(|e| NodeError::Transport(format!("Failed to connect to {addr}: {e}")))?;

    stream
        .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT_MS)))
        .map_err(|e| NodeError::Transport(format!("Failed to set write timeout: {e}")))?;

    serde_json::to_writer(&stream, message)
        .map_err(|e| NodeError::Transport(format!("Failed to send {}: {e}", message.tag())))?;

    let _ = stream.flush();
    Ok(())
}
