//! Data storage
//!
//! This module holds the mempool for pending transactions and the
//! append-only chain store used when persistence is configured.

pub mod chain_store;
pub mod mempool;

pub use chain_store::ChainStore;
pub use mempool::Mempool;
