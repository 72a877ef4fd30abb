use crate::core::Transaction;
use crate::error::{NodeError, Result};
use crate::utils::sha256_digest;

/// Merkle tree over transaction ids
///
/// The root commits a block to its transaction set. Levels are built by
/// pairing neighbours and hashing left||right with the same SHA-256 used for
/// block hashing; an odd node is paired with itself.
pub struct MerkleTree;

impl MerkleTree {
    /// Calculate the Merkle root from a list of transaction ids
    pub fn calculate_merkle_root(transaction_ids: &[Vec<u8>]) -> Result<Vec<u8>> {
        if transaction_ids.is_empty() {
            return Err(NodeError::Validation(
                "Cannot calculate Merkle root from empty transaction list".to_string(),
            ));
        }

        // A single transaction is paired with itself, like any odd node
        if transaction_ids.len() == 1 {
            return Ok(Self::hash_pair(&transaction_ids[0], &transaction_ids[0]));
        }

        let mut current_level = transaction_ids.to_vec();

        while current_level.len() > 1 {
            let mut next_level = Vec::new();
            let mut i = 0;

            while i < current_level.len() {
                let left = &current_level[i];
                let right = if i + 1 < current_level.len() {
                    &current_level[i + 1]
                } else {
                    // Duplicate the last hash if odd number
                    &current_level[i]
                };

                next_level.push(Self::hash_pair(left, right));

                i += if i + 1 < current_level.len() { 2 } else { 1 };
            }

            current_level = next_level;
        }

        current_level
            .into_iter()
            .next()
            .ok_or_else(|| NodeError::Internal("Merkle reduction lost its root".to_string()))
    }

    /// Root over a transaction list's ids
    pub fn root_of(transactions: &[Transaction]) -> Result<Vec<u8>> {
        let ids: Vec<Vec<u8>> = transactions
            .iter()
            .map(|tx| tx.get_id().to_vec())
            .collect();
        Self::calculate_merkle_root(&ids)
    }

    /// Verify that a list of transactions produces the expected Merkle root
    pub fn verify_transactions(transactions: &[Transaction], expected_root: &[u8]) -> Result<bool> {
        let calculated_root = Self::root_of(transactions)?;
        Ok(calculated_root == expected_root)
    }

    fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut combined = Vec::with_capacity(left.len() + right.len());
        combined.extend_from_slice(left);
        combined.extend_from_slice(right);
        sha256_digest(&combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_calculation() {
        let hashes = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10, 11, 12]];

        let root = MerkleTree::calculate_merkle_root(&hashes).unwrap();
        assert_eq!(root.len(), 32);
    }

    #[test]
    fn test_single_transaction_merkle_root() {
        let hashes = vec![vec![1, 2, 3, 4]];
        let root = MerkleTree::calculate_merkle_root(&hashes).unwrap();

        let expected_root = MerkleTree::hash_pair(&hashes[0], &hashes[0]);
        assert_eq!(root, expected_root);
        assert_ne!(root, hashes[0]);
    }

    #[test]
    fn test_empty_transaction_list() {
        let hashes: Vec<Vec<u8>> = vec![];
        let result = MerkleTree::calculate_merkle_root(&hashes);
        assert!(result.is_err());
    }

    #[test]
    fn test_root_commits_to_order_and_content() {
        let a = vec![vec![1u8; 32], vec![2u8; 32]];
        let b = vec![vec![2u8; 32], vec![1u8; 32]];
        assert_ne!(
            MerkleTree::calculate_merkle_root(&a).unwrap(),
            MerkleTree::calculate_merkle_root(&b).unwrap()
        );

        let c = vec![vec![1u8; 32], vec![3u8; 32]];
        assert_ne!(
            MerkleTree::calculate_merkle_root(&a).unwrap(),
            MerkleTree::calculate_merkle_root(&c).unwrap()
        );
    }
}
