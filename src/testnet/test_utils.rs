//! Helpers for building small ledgers and sealing blocks in tests

use crate::consensus::{ConsensusEngine, ConsensusMode};
use crate::core::{Block, Ledger, LedgerParams};
use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

/// Miner address used by the ledger test suites
pub const LEDGER_MINER: &str = "miner";

/// A pure proof-of-work engine at test-friendly difficulty
pub fn pow_engine() -> ConsensusEngine {
    ConsensusEngine::new(ConsensusMode::Pow, 1.0, 10_000_000)
}

/// Ledger parameters tuned for fast tests: difficulty 1, small windows
pub fn test_params(allocations: &[(&str, u64)]) -> LedgerParams {
    let mut genesis_allocations = BTreeMap::new();
    for (address, amount) in allocations {
        genesis_allocations.insert(address.to_string(), *amount);
    }
    LedgerParams {
        initial_difficulty: 1,
        genesis_allocations,
        ..LedgerParams::default()
    }
}

/// In-memory proof-of-work ledger with the given opening balances
pub fn funded_ledger(allocations: &[(&str, u64)]) -> Ledger {
    Ledger::new(test_params(allocations), pow_engine(), None)
        .expect("Failed to create test ledger")
}

/// Assemble, seal via proof-of-work, and append one block for the test miner
pub fn seal_and_append(ledger: &Ledger) -> Result<Block> {
    let mut block = ledger.assemble_block(LEDGER_MINER)?;
    let registry = ledger.registry_snapshot();
    let cancel = AtomicBool::new(false);
    let mut rng = rand::thread_rng();
    pow_engine().seal(&mut block, &registry, LEDGER_MINER, &cancel, &mut rng)?;
    ledger.append_block(block.clone())?;
    Ok(block)
}
