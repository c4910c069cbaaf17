use crate::core::Block;
use crate::error::{BlockchainError, Result};
use log::debug;
use sled::transaction::TransactionError;
use sled::{Batch, Db, Tree};
use std::path::Path;
use std::thread;
use std::time::Duration;

const TIP_BLOCK_HASH_KEY: &str = "tip_block_hash";
const BLOCKS_TREE: &str = "blocks";
const UTXO_TREE: &str = "chainstate";
const OPEN_ATTEMPTS: u32 = 40;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Persistent block storage: block hash -> serialized block, plus the tip
/// pointer under a reserved key of the same tree.
#[derive(Clone)]
pub struct LedgerStore {
    db: Db,
    blocks: Tree,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<LedgerStore> {
        let path = path.as_ref();
        let db = Self::open_db(path)?;
        let blocks = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::StoreIo(format!("Failed to open blocks tree: {e}")))?;
        debug!("Opened ledger store at {}", path.display());
        Ok(LedgerStore { db, blocks })
    }

    // sled's background flusher can hold the directory lock for a moment
    // after the last handle of a previous open is dropped.
    fn open_db(path: &Path) -> Result<Db> {
        let mut attempt = 1;
        loop {
            match sled::open(path) {
                Ok(db) => return Ok(db),
                Err(sled::Error::Io(e)) if attempt < OPEN_ATTEMPTS => {
                    debug!(
                        "Database at {} not available yet ({e}), retrying",
                        path.display()
                    );
                    thread::sleep(OPEN_RETRY_DELAY);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BlockchainError::StoreIo(format!(
                        "Failed to open database: {e}"
                    )))
                }
            }
        }
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Stores a block without touching the tip.
    pub fn put_block(&self, block: &Block) -> Result<()> {
        self.blocks
            .insert(block.get_hash(), block.serialize()?)
            .map_err(|e| BlockchainError::StoreIo(format!("Failed to store block: {e}")))?;
        Ok(())
    }

    pub fn tip(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blocks
            .get(TIP_BLOCK_HASH_KEY)?
            .map(|bytes| bytes.to_vec()))
    }

    pub fn set_tip(&self, hash: &[u8]) -> Result<()> {
        self.blocks
            .insert(TIP_BLOCK_HASH_KEY, hash)
            .map_err(|e| BlockchainError::StoreIo(format!("Failed to update tip: {e}")))?;
        Ok(())
    }

    /// Stores `block` and makes it the tip in one transaction.
    pub fn append(&self, block: &Block) -> Result<()> {
        let block_hash = block.get_hash();
        let block_data = block.serialize()?;

        self.blocks
            .transaction(|tx_db| {
                tx_db.insert(block_hash, block_data.as_slice())?;
                tx_db.insert(TIP_BLOCK_HASH_KEY, block_hash)?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::StoreIo(format!("Failed to append block: {e:?}"))
            })?;
        Ok(())
    }

    /// Swaps the whole block set and the tip in a single batch.
    pub fn replace_all(&self, blocks: &[Block], tip: &[u8]) -> Result<()> {
        let mut batch = Batch::default();
        for key in self.blocks.iter().keys() {
            batch.remove(key?);
        }
        for block in blocks {
            batch.insert(block.get_hash(), block.serialize()?);
        }
        batch.insert(TIP_BLOCK_HASH_KEY, tip);

        self.blocks
            .apply_batch(batch)
            .map_err(|e| BlockchainError::StoreIo(format!("Failed to replace chain: {e}")))?;
        Ok(())
    }

    /// Tree holding the unspent output index.
    pub fn utxo_tree(&self) -> Result<Tree> {
        self.db
            .open_tree(UTXO_TREE)
            .map_err(|e| BlockchainError::StoreIo(format!("Failed to open UTXO tree: {e}")))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use tempfile::tempdir;

    const TEST_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    fn mined(pre_block_hash: Vec<u8>) -> Block {
        let coinbase = Transaction::new_coinbase_tx(TEST_ADDRESS, "").unwrap();
        Block::new_block(pre_block_hash, &[coinbase]).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_tip() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        assert_eq!(store.tip().unwrap(), None);
        assert_eq!(store.get_block(&[0u8; 32]).unwrap(), None);
    }

    #[test]
    fn test_put_block_leaves_tip_alone() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let block = mined(vec![]);

        store.put_block(&block).unwrap();
        assert!(store.contains(block.get_hash()).unwrap());
        assert_eq!(store.tip().unwrap(), None);

        store.set_tip(block.get_hash()).unwrap();
        assert_eq!(store.tip().unwrap(), Some(block.get_hash().to_vec()));
    }

    #[test]
    fn test_append_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let genesis = mined(vec![]);
        {
            let store = LedgerStore::open(dir.path()).unwrap();
            store.append(&genesis).unwrap();
            store.flush().unwrap();
        }

        let store = LedgerStore::open(dir.path()).unwrap();
        assert_eq!(store.tip().unwrap(), Some(genesis.get_hash().to_vec()));
        assert_eq!(store.get_block(genesis.get_hash()).unwrap(), Some(genesis));
    }

    #[test]
    fn test_reopen_right_after_drop() {
        let dir = tempdir().unwrap();
        let genesis = mined(vec![]);
        LedgerStore::open(dir.path())
            .unwrap()
            .append(&genesis)
            .unwrap();

        for _ in 0..5 {
            let store = LedgerStore::open(dir.path()).unwrap();
            assert_eq!(store.tip().unwrap(), Some(genesis.get_hash().to_vec()));
            store.flush().unwrap();
        }
    }

    #[test]
    fn test_replace_all_drops_old_blocks() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let old = mined(vec![]);
        store.append(&old).unwrap();

        let genesis = mined(vec![]);
        let next = mined(genesis.get_hash().to_vec());
        store
            .replace_all(&[next.clone(), genesis.clone()], next.get_hash())
            .unwrap();

        assert!(!store.contains(old.get_hash()).unwrap());
        assert!(store.contains(genesis.get_hash()).unwrap());
        assert_eq!(store.tip().unwrap(), Some(next.get_hash().to_vec()));
    }
}
