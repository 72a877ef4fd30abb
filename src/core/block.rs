use crate::core::monetary::GENESIS_SENDER;
use crate::core::{MerkleTree, Transaction, TransactionBuilder};
use crate::error::{NodeError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which sub-engine sealed a block. Hybrid nodes record the engine actually
/// chosen for the attempt, so verification can dispatch on the tag alone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusTag {
    Pow,
    Pos,
}

impl ConsensusTag {
    fn as_byte(self) -> u8 {
        match self {
            ConsensusTag::Pow => 0,
            ConsensusTag::Pos => 1,
        }
    }
}

impl std::fmt::Display for ConsensusTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusTag::Pow => write!(f, "pow"),
            ConsensusTag::Pos => write!(f, "pos"),
        }
    }
}

/// Hash recorded by the genesis block as its parent
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    index: u64,
    timestamp: i64,
    previous_hash: String,
    transactions: Vec<Transaction>,
    nonce: i64,
    difficulty: u32,
    merkle_root: Vec<u8>,
    proposer: String,
    consensus_tag: ConsensusTag,
    hash: String,
}

impl Block {
    /// Assemble an unsealed block. The consensus engine picks the tag and
    /// produces the seal; until then the hash is the nonce-zero hash.
    pub fn new(
        previous_hash: String,
        transactions: &[Transaction],
        index: u64,
        difficulty: u32,
        proposer: &str,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(NodeError::Validation(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let merkle_root = MerkleTree::root_of(transactions)?;

        let mut block = Block {
            index,
            timestamp: current_timestamp()?,
            previous_hash,
            transactions: transactions.to_vec(),
            nonce: 0,
            difficulty,
            merkle_root,
            proposer: proposer.to_string(),
            consensus_tag: ConsensusTag::Pow,
            hash: String::new(),
        };
        block.hash = block.compute_hash(0);
        Ok(block)
    }

    /// Deterministic genesis: timestamp zero, the configured opening
    /// balances, nonce zero. Identically-configured nodes derive the same
    /// genesis hash without exchanging a byte.
    pub fn generate_genesis_block(
        allocations: &BTreeMap<String, u64>,
        difficulty: u32,
    ) -> Result<Block> {
        let mut transactions = Vec::new();
        for (address, amount) in allocations {
            transactions.push(TransactionBuilder::genesis_allocation(address, *amount)?);
        }
        if transactions.is_empty() {
            // A chain with no opening balances still needs a genesis record
            transactions.push(TransactionBuilder::genesis_allocation(GENESIS_SENDER, 0)?);
        }

        let merkle_root = MerkleTree::root_of(&transactions)?;
        let mut block = Block {
            index: 0,
            timestamp: 0,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            transactions,
            nonce: 0,
            difficulty,
            merkle_root,
            proposer: GENESIS_SENDER.to_string(),
            consensus_tag: ConsensusTag::Pow,
            hash: String::new(),
        };
        block.hash = block.compute_hash(0);
        Ok(block)
    }

    /// Header bytes hashed for the block hash. The Merkle root stands in for
    /// the transaction list, so the hash commits to every field.
    pub fn header_bytes(&self, nonce: i64) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(self.previous_hash.as_bytes());
        data.extend(&self.merkle_root);
        data.extend(self.timestamp.to_be_bytes());
        data.extend(self.index.to_be_bytes());
        data.extend(self.difficulty.to_be_bytes());
        data.extend(self.proposer.as_bytes());
        data.push(self.consensus_tag.as_byte());
        data.extend(nonce.to_be_bytes());
        data
    }

    pub fn compute_hash(&self, nonce: i64) -> String {
        HEXLOWER.encode(&sha256_digest(&self.header_bytes(nonce)))
    }

    /// Install the seal found by a consensus engine
    pub fn set_seal(&mut self, nonce: i64, hash: String) {
        self.nonce = nonce;
        self.hash = hash;
    }

    pub fn set_consensus_tag(&mut self, tag: ConsensusTag) {
        self.consensus_tag = tag;
        self.hash = self.compute_hash(self.nonce);
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_previous_hash(&self) -> &str {
        self.previous_hash.as_str()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_merkle_root(&self) -> &[u8] {
        &self.merkle_root
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn get_proposer(&self) -> &str {
        &self.proposer
    }

    pub fn get_consensus_tag(&self) -> ConsensusTag {
        self.consensus_tag
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    /// Sum of fees carried by the block's transactions
    pub fn total_fees(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.get_fee()).sum()
    }

    pub fn contains_transaction(&self, id: &[u8]) -> bool {
        self.transactions.iter().any(|tx| tx.get_id() == id)
    }

    /// Verify that the block's Merkle root matches its transactions
    pub fn verify_merkle_root(&self) -> Result<bool> {
        MerkleTree::verify_transactions(&self.transactions, &self.merkle_root)
    }

    /// Create a block with a custom timestamp (for testing only)
    #[cfg(test)]
    pub fn new_test_block(
        timestamp: i64,
        previous_hash: String,
        transactions: &[Transaction],
        index: u64,
        difficulty: u32,
    ) -> Result<Block> {
        let merkle_root = MerkleTree::root_of(transactions)?;
        let mut block = Block {
            index,
            timestamp,
            previous_hash,
            transactions: transactions.to_vec(),
            nonce: 0,
            difficulty,
            merkle_root,
            proposer: "test-proposer".to_string(),
            consensus_tag: ConsensusTag::Pow,
            hash: String::new(),
        };
        block.hash = block.compute_hash(0);
        Ok(block)
    }
}
