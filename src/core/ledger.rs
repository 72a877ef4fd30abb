// The ledger owns every piece of consensus-critical state: the chain, the
// balance projection, the validator registry, and the mempool. All of it
// sits behind one lock with a single-writer discipline, so a transaction
// admitted at time t either appears in a later block or is still in the
// mempool; it is never silently dropped. The chain is authoritative; the
// balance projection is a cache rebuilt on reorg and on restart.

use crate::consensus::{ConsensusEngine, Validator, ValidatorRegistry};
use crate::core::contract;
use crate::core::{Block, DifficultyAdjustment, Transaction, TxKind};
use crate::error::{NodeError, Result};
use crate::storage::{ChainStore, Mempool};
use crate::utils::current_timestamp;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

/// Ledger tuning, lifted from the node configuration
#[derive(Debug, Clone)]
pub struct LedgerParams {
    pub initial_difficulty: u32,
    pub difficulty_window: u64,
    pub target_block_interval_ms: u64,
    pub max_block_transactions: usize,
    pub mempool_capacity: usize,
    pub duplicate_lookback: u64,
    pub min_validator_stake: u64,
    pub stake_pool_address: String,
    pub verify_signatures: bool,
    pub genesis_allocations: BTreeMap<String, u64>,
}

impl Default for LedgerParams {
    fn default() -> Self {
        LedgerParams {
            initial_difficulty: 1,
            difficulty_window: 100,
            target_block_interval_ms: 30_000,
            max_block_transactions: 100,
            mempool_capacity: 10_000,
            duplicate_lookback: 100,
            min_validator_stake: 1_000,
            stake_pool_address: "stakepool".to_string(),
            verify_signatures: false,
            genesis_allocations: BTreeMap::new(),
        }
    }
}

/// Chain-derived state: everything a reorg has to rebuild from scratch
#[derive(Clone)]
struct ChainState {
    chain: Vec<Block>,
    balances: HashMap<String, u64>,
    validators: ValidatorRegistry,
}

struct LedgerState {
    chain_state: ChainState,
    mempool: Mempool,
}

pub struct Ledger {
    state: RwLock<LedgerState>,
    engine: ConsensusEngine,
    params: LedgerParams,
    store: Option<ChainStore>,
}

/// Balance and registry deltas computed by block validation, committed only
/// after every check has passed
struct AppliedBlock {
    balances: HashMap<String, u64>,
    validators: ValidatorRegistry,
}

impl Ledger {
    /// Create a ledger from the configured genesis, or replay an existing
    /// chain store when one is present and non-empty.
    pub fn new(
        params: LedgerParams,
        engine: ConsensusEngine,
        store: Option<ChainStore>,
    ) -> Result<Ledger> {
        let stored_blocks = match &store {
            Some(store) if !store.is_empty()? => Some(store.load_all()?),
            _ => None,
        };

        let chain_state = match stored_blocks {
            Some(blocks) => {
                info!("Replaying {} blocks from the chain store", blocks.len());
                Self::replay(blocks, &engine, &params)?
            }
            None => {
                let genesis =
                    Block::generate_genesis_block(&params.genesis_allocations, params.initial_difficulty)?;
                info!("Created genesis block {}", genesis.get_hash());
                if let Some(store) = &store {
                    store.append(&genesis)?;
                }
                Self::bootstrap(genesis, &params)?
            }
        };

        Ok(Ledger {
            state: RwLock::new(LedgerState {
                chain_state,
                mempool: Mempool::new(params.mempool_capacity),
            }),
            engine,
            params,
            store,
        })
    }

    /// Fold the genesis block into a fresh chain state
    fn bootstrap(genesis: Block, params: &LedgerParams) -> Result<ChainState> {
        let mut balances = HashMap::new();
        for tx in genesis.get_transactions() {
            if !tx.is_genesis_allocation() {
                return Err(NodeError::Validation(
                    "genesis block may only carry genesis allocations".to_string(),
                ));
            }
            credit(&mut balances, tx.get_recipient(), tx.get_amount())?;
        }

        Ok(ChainState {
            chain: vec![genesis],
            balances,
            validators: ValidatorRegistry::new(params.min_validator_stake),
        })
    }

    /// Rebuild chain state by replaying a stored or rolled-back prefix
    fn replay(
        blocks: Vec<Block>,
        engine: &ConsensusEngine,
        params: &LedgerParams,
    ) -> Result<ChainState> {
        let mut blocks = blocks.into_iter();
        let genesis = blocks
            .next()
            .ok_or_else(|| NodeError::Database("chain store holds no genesis".to_string()))?;
        let mut chain_state = Self::bootstrap(genesis, params)?;

        for block in blocks {
            let applied = Self::validate_block(&chain_state, &block, engine, params)?;
            Self::commit_block(&mut chain_state, block, applied);
        }
        Ok(chain_state)
    }

    // ---- admission ----

    /// Validate a transaction and admit it to the mempool
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        let now = current_timestamp()?;
        let mut state = self
            .state
            .write()
            .expect("Failed to acquire write lock on ledger state - this should never happen");

        Self::check_admissible(&state, &tx, now, &self.params, false)?;
        let txid = tx.id_hex();
        state.mempool.insert(tx)?;
        info!("Admitted transaction {txid} to mempool");
        Ok(())
    }

    /// Shared admission predicate. `readmission` relaxes the time-lock
    /// freshness rule for transactions returning to the mempool after a
    /// reorg: a lock that expired while the transaction sat in the old chain
    /// must not strand it.
    fn check_admissible(
        state: &LedgerState,
        tx: &Transaction,
        now: i64,
        params: &LedgerParams,
        readmission: bool,
    ) -> Result<()> {
        tx.verify_structure(params.verify_signatures)?;

        if tx.is_genesis_allocation() {
            return Err(NodeError::Validation(
                "genesis allocations cannot be submitted".to_string(),
            ));
        }

        if let TxKind::TimeLocked { unlock_time } = tx.get_kind() {
            if !readmission && *unlock_time <= now {
                return Err(NodeError::Validation(
                    "time lock already expired; submit a standard transfer instead".to_string(),
                ));
            }
        }

        let txid = tx.id_hex();
        if state.mempool.contains(&txid) {
            return Err(NodeError::Validation(format!(
                "transaction {txid} already in mempool"
            )));
        }
        if Self::id_in_recent_chain(&state.chain_state.chain, tx.get_id(), params.duplicate_lookback)
        {
            return Err(NodeError::Validation(format!(
                "transaction {txid} already in the chain"
            )));
        }

        // Funding: the projected balance minus obligations already pending
        // in the mempool must cover amount plus fee
        match tx.get_kind() {
            TxKind::MultiSig { signers, .. } => {
                let pooled: u64 = signers
                    .iter()
                    .map(|s| state.chain_state.balances.get(s).copied().unwrap_or(0))
                    .sum();
                if pooled < tx.debit_total() {
                    return Err(NodeError::InsufficientFunds {
                        required: tx.debit_total(),
                        available: pooled,
                    });
                }
            }
            _ => {
                let balance = state
                    .chain_state
                    .balances
                    .get(tx.get_sender())
                    .copied()
                    .unwrap_or(0);
                let pending = state.mempool.pending_debit(tx.get_sender());
                let spendable = balance.saturating_sub(pending);
                if spendable < tx.debit_total() {
                    return Err(NodeError::InsufficientFunds {
                        required: tx.debit_total(),
                        available: spendable,
                    });
                }
            }
        }

        Ok(())
    }

    fn id_in_recent_chain(chain: &[Block], id: &[u8], lookback: u64) -> bool {
        chain
            .iter()
            .rev()
            .take(lookback as usize)
            .any(|block| block.contains_transaction(id))
    }

    /// Append a signature to a pending multi-sig transaction
    pub fn add_signature(&self, txid_hex: &str, signer: &str, signature: Vec<u8>) -> Result<()> {
        let mut state = self
            .state
            .write()
            .expect("Failed to acquire write lock on ledger state - this should never happen");
        state.mempool.add_signature(txid_hex, signer, signature)?;
        info!("Collected signature from {signer} on {txid_hex}");
        Ok(())
    }

    // ---- assembly ----

    /// Drain eligible mempool entries into an unsealed block for `proposer`
    pub fn assemble_block(&self, proposer: &str) -> Result<Block> {
        let now = current_timestamp()?;
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");

        // Candidates in fee order, kept only while the whole set still
        // applies cleanly against the head state. A transaction that cannot
        // be funded alongside its better-paying neighbours stays pooled for
        // a later block instead of poisoning this one.
        let candidates = state.mempool.eligible(now, usize::MAX);
        let mut scratch = state.chain_state.balances.clone();
        let mut transactions = Vec::new();
        for tx in candidates {
            if transactions.len() >= self.params.max_block_transactions {
                break;
            }
            let mut trial = scratch.clone();
            if apply_transaction(&mut trial, &tx).is_ok() {
                scratch = trial;
                transactions.push(tx);
            }
        }
        if transactions.is_empty() {
            return Err(NodeError::Resource(
                "no eligible transactions to assemble".to_string(),
            ));
        }

        let head = Self::head_of(&state.chain_state);
        let difficulty = Self::next_difficulty(&state.chain_state, &self.params)?;

        Block::new(
            head.get_hash().to_string(),
            &transactions,
            head.get_index() + 1,
            difficulty,
            proposer,
        )
    }

    fn next_difficulty(chain_state: &ChainState, params: &LedgerParams) -> Result<u32> {
        let chain = &chain_state.chain;
        let next_height = chain.len() as u64;
        let window = params.difficulty_window;

        let recent: &[Block] = if next_height >= window {
            &chain[chain.len() - window as usize..]
        } else {
            chain.as_slice()
        };
        DifficultyAdjustment::calculate_next_difficulty(
            recent,
            next_height,
            window,
            params.target_block_interval_ms,
        )
    }

    // ---- append ----

    /// Fully validate a sealed block against the current head and commit it
    pub fn append_block(&self, block: Block) -> Result<()> {
        let mut state = self
            .state
            .write()
            .expect("Failed to acquire write lock on ledger state - this should never happen");

        let applied = Self::validate_block(&state.chain_state, &block, &self.engine, &self.params)?;

        // Persist before mutating memory: a store failure must leave the
        // committed state untouched
        if let Some(store) = &self.store {
            store.append(&block)?;
        }

        for tx in block.get_transactions() {
            state.mempool.remove(&tx.id_hex());
        }
        let hash = block.get_hash().to_string();
        let index = block.get_index();
        Self::commit_block(&mut state.chain_state, block, applied);

        info!("Appended block {index} ({hash})");
        Ok(())
    }

    /// Every check a block must pass before it extends `chain_state`.
    /// Returns the balance and registry deltas so commit is infallible.
    fn validate_block(
        chain_state: &ChainState,
        block: &Block,
        engine: &ConsensusEngine,
        params: &LedgerParams,
    ) -> Result<AppliedBlock> {
        let parent = Self::head_of(chain_state);

        if chain_state
            .chain
            .iter()
            .any(|existing| existing.get_hash() == block.get_hash())
        {
            return Err(NodeError::Validation(format!(
                "block {} already present",
                block.get_hash()
            )));
        }
        if block.get_index() != parent.get_index() + 1 {
            return Err(NodeError::Validation(format!(
                "block index {} does not extend head at {}",
                block.get_index(),
                parent.get_index()
            )));
        }
        if block.get_previous_hash() != parent.get_hash() {
            return Err(NodeError::Validation(format!(
                "previous hash {} does not match head {}",
                block.get_previous_hash(),
                parent.get_hash()
            )));
        }
        if block.get_transactions().is_empty() {
            return Err(NodeError::Validation(
                "block carries no transactions".to_string(),
            ));
        }
        if !block.verify_merkle_root()? {
            return Err(NodeError::Validation(
                "merkle root does not match transactions".to_string(),
            ));
        }

        let expected_difficulty = Self::next_difficulty(chain_state, params)?;
        if block.get_difficulty() != expected_difficulty {
            return Err(NodeError::Validation(format!(
                "block difficulty {} but the chain requires {expected_difficulty}",
                block.get_difficulty()
            )));
        }

        engine.verify_seal(block, &chain_state.validators)?;

        // Per-transaction validity at mining time
        let mut seen_ids: HashSet<&[u8]> = HashSet::new();
        for tx in block.get_transactions() {
            tx.verify_structure(params.verify_signatures)?;

            if tx.is_genesis_allocation() {
                return Err(NodeError::Validation(
                    "genesis allocation outside the genesis block".to_string(),
                ));
            }
            if !seen_ids.insert(tx.get_id()) {
                return Err(NodeError::Validation(format!(
                    "transaction {} duplicated within the block",
                    tx.id_hex()
                )));
            }
            if Self::id_in_recent_chain(&chain_state.chain, tx.get_id(), params.duplicate_lookback)
            {
                return Err(NodeError::Validation(format!(
                    "transaction {} already in the chain",
                    tx.id_hex()
                )));
            }

            match tx.get_kind() {
                TxKind::MultiSig {
                    required_signatures,
                    collected_signatures,
                    ..
                } => {
                    if collected_signatures.len() < *required_signatures {
                        return Err(NodeError::Validation(format!(
                            "multi-sig {} included with {} of {} signatures",
                            tx.id_hex(),
                            collected_signatures.len(),
                            required_signatures
                        )));
                    }
                }
                TxKind::TimeLocked { unlock_time } => {
                    // The gate is judged at mining time, not admission time
                    if *unlock_time > block.get_timestamp() {
                        return Err(NodeError::Validation(format!(
                            "transaction {} still locked at block time",
                            tx.id_hex()
                        )));
                    }
                }
                _ => {}
            }
        }

        // Aggregate funding: applying the whole block against the parent
        // state must never drive a balance below zero
        let mut balances = chain_state.balances.clone();
        for tx in block.get_transactions() {
            apply_transaction(&mut balances, tx)?;
        }

        // Proposer reward is computed against the registry as of the parent:
        // stake carried by this block takes effect from the next one
        let reward = engine.block_reward(block, &chain_state.validators);
        credit(
            &mut balances,
            block.get_proposer(),
            reward.saturating_add(block.total_fees()),
        )?;

        let mut validators = chain_state.validators.clone();
        for tx in block.get_transactions() {
            if tx.get_recipient() == params.stake_pool_address {
                validators.register_stake(tx.get_sender(), tx.get_amount());
            }
        }
        validators.record_validation(block.get_proposer());

        Ok(AppliedBlock {
            balances,
            validators,
        })
    }

    fn commit_block(chain_state: &mut ChainState, block: Block, applied: AppliedBlock) {
        chain_state.balances = applied.balances;
        chain_state.validators = applied.validators;
        chain_state.chain.push(block);
    }

    // ---- reorganization ----

    /// Adopt a peer-supplied chain fragment when it beats the local chain.
    ///
    /// The fragment must anchor at a block we hold. The candidate is
    /// replayed on a scratch state from genesis; only when every block
    /// validates and the candidate is strictly longer (or equal length with
    /// a strictly lower head hash) does it replace the local tail. A failed
    /// attempt leaves local state untouched.
    pub fn try_reorg(&self, fragment: &[Block]) -> Result<()> {
        let first = fragment.first().ok_or_else(|| {
            NodeError::Validation("empty chain fragment".to_string())
        })?;

        let mut state = self
            .state
            .write()
            .expect("Failed to acquire write lock on ledger state - this should never happen");

        let fork_idx = state
            .chain_state
            .chain
            .iter()
            .position(|block| block.get_hash() == first.get_previous_hash())
            .ok_or_else(|| {
                NodeError::Consensus(format!(
                    "fragment anchors at unknown block {}",
                    first.get_previous_hash()
                ))
            })?;

        let local_len = state.chain_state.chain.len();
        let candidate_len = fork_idx + 1 + fragment.len();
        let local_head_hash = Self::head_of(&state.chain_state).get_hash().to_string();
        let candidate_head_hash = fragment
            .last()
            .map(|b| b.get_hash().to_string())
            .unwrap_or_default();

        let adopts = candidate_len > local_len
            || (candidate_len == local_len && candidate_head_hash < local_head_hash);
        if !adopts {
            return Err(NodeError::Consensus(format!(
                "candidate chain of {candidate_len} does not beat local {local_len}"
            )));
        }

        // Replay the shared prefix, then the fragment, on a scratch state
        let prefix = state.chain_state.chain[..=fork_idx].to_vec();
        let mut scratch = Self::replay(prefix, &self.engine, &self.params)?;
        for block in fragment {
            let applied = Self::validate_block(&scratch, block, &self.engine, &self.params)?;
            Self::commit_block(&mut scratch, block.clone(), applied);
        }

        // Transactions in the abandoned tail that the new chain does not
        // carry go back to the mempool, subject to current eligibility
        let new_ids: HashSet<Vec<u8>> = fragment
            .iter()
            .flat_map(|b| b.get_transactions())
            .map(|tx| tx.get_id().to_vec())
            .collect();
        let rolled_back: Vec<Transaction> = state.chain_state.chain[fork_idx + 1..]
            .iter()
            .flat_map(|b| b.get_transactions())
            .filter(|tx| !new_ids.contains(tx.get_id()))
            .cloned()
            .collect();

        if let Some(store) = &self.store {
            store.truncate_from(fork_idx as u64 + 1)?;
            for block in fragment {
                store.append(block)?;
            }
        }

        let abandoned = state.chain_state.chain.len() - (fork_idx + 1);
        state.chain_state = scratch;
        for tx in fragment.iter().flat_map(|b| b.get_transactions()) {
            state.mempool.remove(&tx.id_hex());
        }

        let now = current_timestamp()?;
        for tx in rolled_back {
            let txid = tx.id_hex();
            match Self::check_admissible(&state, &tx, now, &self.params, true) {
                Ok(()) => {
                    if let Err(e) = state.mempool.insert(tx) {
                        warn!("Rolled-back transaction {txid} not readmitted: {e}");
                    }
                }
                Err(e) => {
                    warn!("Rolled-back transaction {txid} dropped: {e}");
                }
            }
        }

        info!(
            "Reorganized: abandoned {abandoned} blocks, adopted {} (new head {})",
            fragment.len(),
            candidate_head_hash
        );
        Ok(())
    }

    // ---- queries ----

    fn head_of(chain_state: &ChainState) -> &Block {
        chain_state
            .chain
            .last()
            .expect("Chain always holds at least the genesis block")
    }

    pub fn head(&self) -> Block {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        Self::head_of(&state.chain_state).clone()
    }

    pub fn block_at(&self, index: u64) -> Option<Block> {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.chain_state.chain.get(index as usize).cloned()
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state
            .chain_state
            .chain
            .iter()
            .find(|block| block.get_hash() == hash)
            .cloned()
    }

    /// Blocks in `[from_index, from_index + limit)`
    pub fn blocks_range(&self, from_index: u64, limit: usize) -> Vec<Block> {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state
            .chain_state
            .chain
            .iter()
            .skip(from_index as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn chain_len(&self) -> u64 {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.chain_state.chain.len() as u64
    }

    pub fn balance(&self, address: &str) -> u64 {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state
            .chain_state
            .balances
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn mempool_snapshot(&self) -> Vec<Transaction> {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.mempool.snapshot()
    }

    pub fn mempool_len(&self) -> usize {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.mempool.len()
    }

    /// Whether the mempool holds anything a miner could include right now
    pub fn has_eligible_work(&self) -> bool {
        let now = match current_timestamp() {
            Ok(now) => now,
            Err(_) => return false,
        };
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.mempool.has_eligible(now)
    }

    pub fn validators_snapshot(&self) -> Vec<Validator> {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.chain_state.validators.snapshot()
    }

    /// Registry clone for sealing outside the ledger lock
    pub fn registry_snapshot(&self) -> ValidatorRegistry {
        let state = self
            .state
            .read()
            .expect("Failed to acquire read lock on ledger state - this should never happen");
        state.chain_state.validators.clone()
    }

    pub fn current_difficulty(&self) -> u32 {
        self.head().get_difficulty()
    }
}

/// Net balance effect of one transaction. Underflow anywhere rejects the
/// containing block, which is what keeps the projection non-negative.
fn apply_transaction(balances: &mut HashMap<String, u64>, tx: &Transaction) -> Result<()> {
    match tx.get_kind() {
        TxKind::Standard | TxKind::TimeLocked { .. } => {
            debit(balances, tx.get_sender(), tx.debit_total())?;
            credit(balances, tx.get_recipient(), tx.get_amount())?;
        }
        TxKind::MultiSig { signers, .. } => {
            // Pooled debit, drawn from signers in listed order
            let mut remaining = tx.debit_total();
            for signer in signers {
                if remaining == 0 {
                    break;
                }
                let available = balances.get(signer).copied().unwrap_or(0);
                let take = available.min(remaining);
                debit(balances, signer, take)?;
                remaining -= take;
            }
            if remaining > 0 {
                return Err(NodeError::InsufficientFunds {
                    required: tx.debit_total(),
                    available: tx.debit_total() - remaining,
                });
            }
            credit(balances, tx.get_recipient(), tx.get_amount())?;
        }
        TxKind::DataStorage { .. } => {
            debit(balances, tx.get_sender(), tx.debit_total())?;
            credit(balances, tx.get_recipient(), tx.get_amount())?;
        }
        TxKind::SmartContract { args, .. } => {
            let code = tx
                .get_metadata()
                .and_then(|m| std::str::from_utf8(m).ok())
                .ok_or_else(|| {
                    NodeError::Validation("contract transaction carries no source".to_string())
                })?;
            let effects = contract::execute(code, args)?;
            let paid_out: u64 = effects.iter().map(|e| e.amount).sum();
            if paid_out > tx.get_amount() {
                return Err(NodeError::Validation(format!(
                    "contract pays out {paid_out} but is funded with {}",
                    tx.get_amount()
                )));
            }

            debit(balances, tx.get_sender(), tx.debit_total())?;
            for effect in &effects {
                credit(balances, &effect.recipient, effect.amount)?;
            }
            // Whatever the program leaves unspent stays with the contract
            credit(balances, tx.get_recipient(), tx.get_amount() - paid_out)?;
        }
    }
    Ok(())
}

fn debit(balances: &mut HashMap<String, u64>, address: &str, amount: u64) -> Result<()> {
    let balance = balances.entry(address.to_string()).or_insert(0);
    if *balance < amount {
        return Err(NodeError::InsufficientFunds {
            required: amount,
            available: *balance,
        });
    }
    *balance -= amount;
    Ok(())
}

fn credit(balances: &mut HashMap<String, u64>, address: &str, amount: u64) -> Result<()> {
    let balance = balances.entry(address.to_string()).or_insert(0);
    *balance = balance.checked_add(amount).ok_or_else(|| {
        NodeError::Internal(format!("balance overflow crediting {address}"))
    })?;
    Ok(())
}
