use crate::consensus::ConsensusMode;
use crate::error::{NodeError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

/// Global configuration, replaced once by the CLI after parsing arguments
pub static GLOBAL_CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::from_env()));

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
const DEFAULT_LISTEN_PORT: u16 = 7341;
const DEFAULT_API_BIND: &str = "127.0.0.1:7380";

/// Node configuration
///
/// Every field has a default, so a configuration file only needs to name the
/// options it overrides. `NODE_ID` and `LISTEN_PORT` environment variables
/// take precedence over both, which keeps multi-node setups on one machine
/// easy to script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity advertised in the handshake
    pub node_id: String,
    /// Peer server bind address
    pub listen_address: String,
    /// Peer server bind port
    pub listen_port: u16,
    /// Initial peer addresses contacted on startup
    pub seed_peers: Vec<String>,
    /// Bind address handed to the API collaborator
    pub api_bind: String,
    /// Difficulty adjustment target, milliseconds per block
    pub target_block_interval_ms: u64,
    /// Starting proof-of-work difficulty in leading zero nibbles
    pub initial_difficulty: u32,
    /// Blocks between difficulty adjustments
    pub difficulty_window: u64,
    /// Maximum transactions drained into one block
    pub max_block_transactions: usize,
    /// Mempool admission cap
    pub mempool_capacity: usize,
    /// Consensus engine selection
    pub consensus_mode: ConsensusMode,
    /// Hybrid bias toward proof-of-work (pow_weight + pos_weight = 1)
    pub pow_weight: f64,
    /// Hybrid bias toward proof-of-stake
    pub pos_weight: f64,
    /// Stake floor below which a validator is inactive
    pub min_validator_stake: u64,
    /// Gate for the miner task
    pub mining_enabled: bool,
    /// Address credited with block rewards when this node proposes
    pub miner_address: Option<String>,
    /// When false the signature hook accepts everything; the hook is still
    /// invoked so the boundary stays visible
    pub signature_verification: bool,
    /// Blocks searched backwards for duplicate transaction ids on admission
    pub duplicate_lookback: u64,
    /// Transfers to this address register stake for their sender
    pub stake_pool_address: String,
    /// Nonce attempts before a sealing attempt reports exhaustion
    pub sealing_budget: u64,
    /// Seconds between liveness pings per peer
    pub ping_interval_secs: u64,
    /// Blocks backtracked on the first reconciliation attempt
    pub backtrack_window: u64,
    /// Backtrack ceiling before a peer's chain claim is dropped
    pub max_backtrack: u64,
    /// Chain store directory; `None` keeps the node fully in memory
    pub data_dir: Option<String>,
    /// Opening balances folded into the genesis block, address -> amount
    pub genesis_allocations: BTreeMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: format!("node-{DEFAULT_LISTEN_PORT}"),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            seed_peers: Vec::new(),
            api_bind: DEFAULT_API_BIND.to_string(),
            target_block_interval_ms: 30_000,
            initial_difficulty: 4,
            difficulty_window: 100,
            max_block_transactions: 100,
            mempool_capacity: 10_000,
            consensus_mode: ConsensusMode::Hybrid,
            pow_weight: 0.3,
            pos_weight: 0.7,
            min_validator_stake: 1_000,
            mining_enabled: false,
            miner_address: None,
            signature_verification: false,
            duplicate_lookback: 100,
            stake_pool_address: "stakepool".to_string(),
            sealing_budget: 10_000_000,
            ping_interval_secs: 30,
            backtrack_window: 32,
            max_backtrack: 1_024,
            data_dir: None,
            genesis_allocations: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Config {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Load a configuration file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let mut config: Config = serde_json::from_str(&contents)
            .map_err(|e| NodeError::Config(format!("Failed to parse {}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(node_id) = env::var("NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(port) = env::var("LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(addr) = env::var("MINER_ADDRESS") {
            self.miner_address = Some(addr);
        }
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.initial_difficulty) {
            return Err(NodeError::Config(format!(
                "initial_difficulty {} outside [1, 10]",
                self.initial_difficulty
            )));
        }
        if self.consensus_mode == ConsensusMode::Hybrid {
            let total = self.pow_weight + self.pos_weight;
            if !(0.999..=1.001).contains(&total) || self.pow_weight < 0.0 || self.pos_weight < 0.0 {
                return Err(NodeError::Config(format!(
                    "pow_weight {} and pos_weight {} must be non-negative and sum to 1",
                    self.pow_weight, self.pos_weight
                )));
            }
        }
        if self.mining_enabled && self.miner_address.is_none() {
            return Err(NodeError::Config(
                "mining_enabled requires miner_address".to_string(),
            ));
        }
        if self.difficulty_window < 2 {
            return Err(NodeError::Config(
                "difficulty_window must be at least 2".to_string(),
            ));
        }
        if self.max_block_transactions == 0 || self.mempool_capacity == 0 {
            return Err(NodeError::Config(
                "max_block_transactions and mempool_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The peer server bind as `address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

impl From<&Config> for crate::core::LedgerParams {
    fn from(config: &Config) -> Self {
        crate::core::LedgerParams {
            initial_difficulty: config.initial_difficulty,
            difficulty_window: config.difficulty_window,
            target_block_interval_ms: config.target_block_interval_ms,
            max_block_transactions: config.max_block_transactions,
            mempool_capacity: config.mempool_capacity,
            duplicate_lookback: config.duplicate_lookback,
            min_validator_stake: config.min_validator_stake,
            stake_pool_address: config.stake_pool_address.clone(),
            verify_signatures: config.signature_verification,
            genesis_allocations: config.genesis_allocations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        config.validate().unwrap();

        config.mining_enabled = true;
        assert!(config.validate().is_err());
        config.miner_address = Some("miner".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_hybrid_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.pow_weight = 0.5;
        config.pos_weight = 0.7;
        assert!(config.validate().is_err());

        config.consensus_mode = ConsensusMode::Pow;
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"listen_port": 9100, "mempool_capacity": 64}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mempool_capacity, 64);
        assert_eq!(config.initial_difficulty, Config::default().initial_difficulty);
    }
}
