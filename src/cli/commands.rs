use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tandem-chain", about = "Hybrid proof-of-work / proof-of-stake blockchain node")]
pub struct Opt {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the node: peer server, miner, and liveness ticker
    StartNode,
    /// Build a standard transfer and hand it to a running node
    Send {
        /// Peer address of the receiving node, e.g. 127.0.0.1:7341
        #[arg(long)]
        node: String,
        from: String,
        to: String,
        amount: u64,
        #[arg(long, default_value_t = 1)]
        fee: u64,
    },
    /// Register stake for an address via a running node
    RegisterStake {
        /// Peer address of the receiving node
        #[arg(long)]
        node: String,
        from: String,
        amount: u64,
        #[arg(long, default_value_t = 1)]
        fee: u64,
    },
    /// Print an address balance from the local chain store
    Balance { address: String },
    /// Walk the local chain store and print every block
    PrintChain,
    /// Print the staked validators recorded on the local chain
    Validators,
}
