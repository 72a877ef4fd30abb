//! Configuration management
//!
//! This module handles configuration for the node: identity, network binds,
//! consensus selection, mining, and ledger tuning.

pub mod settings;

pub use settings::{Config, GLOBAL_CONFIG};
