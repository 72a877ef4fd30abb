//! Monetary constants shared by the ledger and the consensus engine

/// Base reward credited to a block proposer, before fees and stake scaling
pub const BASE_BLOCK_REWARD: u64 = 50;

/// Sender of genesis allocations, exempt from balance checks
pub const GENESIS_SENDER: &str = "genesis";
