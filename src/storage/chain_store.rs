use crate::core::Block;
use crate::error::{NodeError, Result};
use log::info;
use sled::Db;
use std::path::Path;

const BLOCKS_TREE: &str = "blocks";

/// Append-only chain log
///
/// One record per block, keyed by big-endian index so iteration yields the
/// chain in order, value = the block's canonical encoding. The mempool is
/// deliberately not persisted; it is recoverable from peers.
pub struct ChainStore {
    db: Db,
}

impl ChainStore {
    pub fn open(path: &Path) -> Result<ChainStore> {
        let db = sled::open(path)
            .map_err(|e| NodeError::Database(format!("Failed to open chain store: {e}")))?;
        Ok(ChainStore { db })
    }

    fn blocks_tree(&self) -> Result<sled::Tree> {
        self.db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| NodeError::Database(format!("Failed to open blocks tree: {e}")))
    }

    pub fn append(&self, block: &Block) -> Result<()> {
        let tree = self.blocks_tree()?;
        let key = block.get_index().to_be_bytes();
        let value = block.serialize()?;
        tree.insert(key, value)
            .map_err(|e| NodeError::Database(format!("Failed to append block: {e}")))?;
        Ok(())
    }

    /// Drop every record at `from_index` and above. Used when a reorg
    /// replaces the tail of the chain.
    pub fn truncate_from(&self, from_index: u64) -> Result<()> {
        let tree = self.blocks_tree()?;
        let mut removed = 0u64;
        for item in tree.range(from_index.to_be_bytes()..) {
            let (key, _) =
                item.map_err(|e| NodeError::Database(format!("Failed to scan blocks: {e}")))?;
            tree.remove(key)
                .map_err(|e| NodeError::Database(format!("Failed to remove block: {e}")))?;
            removed += 1;
        }
        if removed > 0 {
            info!("Truncated {removed} blocks from index {from_index}");
        }
        Ok(())
    }

    /// The full chain in index order
    pub fn load_all(&self) -> Result<Vec<Block>> {
        let tree = self.blocks_tree()?;
        let mut blocks = Vec::new();
        for item in tree.iter() {
            let (_, value) =
                item.map_err(|e| NodeError::Database(format!("Failed to read block: {e}")))?;
            blocks.push(Block::deserialize(&value)?);
        }
        Ok(blocks)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.blocks_tree()?.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.blocks_tree()?.is_empty())
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| NodeError::Database(format!("Failed to flush chain store: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;
    use tempfile::tempdir;

    fn test_block(index: u64) -> Block {
        let tx = TransactionBuilder::standard("alice", "bob", index + 1, 1).unwrap();
        Block::new(format!("parent-{index}"), &[tx], index, 1, "miner").unwrap()
    }

    #[test]
    fn test_append_and_load_in_order() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(&dir.path().join("chain")).unwrap();

        for index in 0..5 {
            store.append(&test_block(index)).unwrap();
        }

        let blocks = store.load_all().unwrap();
        assert_eq!(blocks.len(), 5);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.get_index(), i as u64);
        }
    }

    #[test]
    fn test_truncate_for_reorg() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(&dir.path().join("chain")).unwrap();

        for index in 0..6 {
            store.append(&test_block(index)).unwrap();
        }
        store.truncate_from(3).unwrap();

        let blocks = store.load_all().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks.last().unwrap().get_index(), 2);
    }

    #[test]
    fn test_round_trip_preserves_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain");
        let original = test_block(0);

        {
            let store = ChainStore::open(&path).unwrap();
            store.append(&original).unwrap();
            store.flush().unwrap();
        }

        let store = ChainStore::open(&path).unwrap();
        let blocks = store.load_all().unwrap();
        assert_eq!(blocks[0], original);
    }
}
