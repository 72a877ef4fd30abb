//! # Tandem Chain
//!
//! A small blockchain node that mines under a hybrid proof-of-work /
//! proof-of-stake rule over an account-balance ledger.
//!
//! ## What's here
//! - **Ledger**: in-memory chain with balance projection, mempool,
//!   validator registry, difficulty adjustment, and fork reorganization
//! - **Transactions**: five tagged variants (standard, multi-sig,
//!   time-locked, data storage, contract) over one canonical encoding
//! - **Consensus**: a bounded, cancellable proof-of-work miner, a
//!   stake-weighted proposer draw, and a hybrid selector between them
//! - **P2P**: TCP gossip of transactions and blocks, handshake with
//!   version checks, chain synchronization with backtracking, liveness
//!   pings
//!
//! ## How the code is organized
//! - `core/`: transactions, blocks, Merkle commitments, the ledger
//! - `consensus/`: the sub-engines and the hybrid selector
//! - `network/`: message protocol, peer registry, gossip server
//! - `storage/`: mempool and the sled-backed chain log
//! - `node/`: task wiring and the client-facing method surface
//! - `config/`, `cli/`, `error/`, `utils/`: the usual supporting cast
//!
//! Reading order when coming back to this: start with `core/ledger.rs`,
//! then `consensus/engine.rs`, then `network/server.rs`.

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::{Config, GLOBAL_CONFIG};
pub use consensus::{ConsensusEngine, ConsensusMode, ProofOfWork, Validator, ValidatorRegistry};
pub use core::{
    Block, ConsensusTag, DifficultyAdjustment, Ledger, LedgerParams, MerkleTree, Transaction,
    TransactionBuilder, TxKind,
};
pub use error::{NodeError, Result};
pub use network::{Message, PeerRegistry, Server, PROTOCOL_VERSION};
pub use node::{Node, NodeStatus};
pub use storage::{ChainStore, Mempool};
pub use utils::{current_timestamp, sha256_digest};
