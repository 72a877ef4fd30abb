use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, LevelFilter};
use std::process;
use tandem_chain::network::{send_message, Message};
use tandem_chain::{
    Command, Config, ConsensusEngine, Ledger, LedgerParams, Node, NodeError, Opt,
    TransactionBuilder, GLOBAL_CONFIG,
};

fn main() {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    let opt = Opt::parse();

    // Resolve configuration once and publish it for the rest of the process
    let config = match &opt.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Error: {e}");
                process::exit(1);
            }
        },
        None => Config::from_env(),
    };
    *GLOBAL_CONFIG
        .write()
        .expect("Failed to acquire write lock on global config - this should never happen") =
        config;

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let config = GLOBAL_CONFIG
        .read()
        .expect("Failed to acquire read lock on global config - this should never happen")
        .clone();

    match command {
        Command::StartNode => {
            let node = Node::new(config)?;
            node.run()?;
        }
        Command::Send {
            node,
            from,
            to,
            amount,
            fee,
        } => {
            let tx = TransactionBuilder::standard(&from, &to, amount, fee)?;
            let message = Message::NewTx {
                addr_from: config.listen_addr(),
                transaction: tx.serialize()?,
            };
            send_message(&node, &message)?;
            println!("Sent transaction {}", tx.id_hex());
        }
        Command::RegisterStake {
            node,
            from,
            amount,
            fee,
        } => {
            let tx =
                TransactionBuilder::standard(&from, &config.stake_pool_address, amount, fee)?;
            let message = Message::NewTx {
                addr_from: config.listen_addr(),
                transaction: tx.serialize()?,
            };
            send_message(&node, &message)?;
            println!("Sent stake registration {}", tx.id_hex());
        }
        Command::Balance { address } => {
            let ledger = open_local_ledger(config)?;
            println!("Balance of {address}: {}", ledger.balance(&address));
        }
        Command::PrintChain => {
            let ledger = open_local_ledger(config)?;
            for index in 0..ledger.chain_len() {
                let block = ledger
                    .block_at(index)
                    .ok_or_else(|| NodeError::Internal(format!("missing block {index}")))?;
                println!(
                    "Block {index} [{}] hash={} prev={} txs={}",
                    block.get_consensus_tag(),
                    block.get_hash(),
                    block.get_previous_hash(),
                    block.get_transactions().len()
                );
                for tx in block.get_transactions() {
                    println!(
                        "- {} {} {} -> {} amount={} fee={}",
                        HEXLOWER.encode(tx.get_id()),
                        tx.get_kind().tag(),
                        tx.get_sender(),
                        tx.get_recipient(),
                        tx.get_amount(),
                        tx.get_fee()
                    );
                }
            }
        }
        Command::Validators => {
            let ledger = open_local_ledger(config)?;
            for validator in ledger.validators_snapshot() {
                println!(
                    "{} stake={} reputation={:.2} blocks={}",
                    validator.address,
                    validator.stake,
                    validator.reputation,
                    validator.blocks_validated
                );
            }
        }
    }
    Ok(())
}

/// Replay the locally persisted chain for read-only commands
fn open_local_ledger(config: Config) -> Result<Ledger, NodeError> {
    let data_dir = config.data_dir.clone().ok_or_else(|| {
        NodeError::Config("this command needs data_dir set in the configuration".to_string())
    })?;
    let store = tandem_chain::ChainStore::open(&std::path::Path::new(&data_dir).join("chain"))?;
    let engine = ConsensusEngine::new(
        config.consensus_mode,
        config.pow_weight,
        config.sealing_budget,
    );
    Ledger::new(LedgerParams::from(&config), engine, Some(store))
}
