use crate::core::{ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    pre_block_hash: Vec<u8>, // empty for genesis
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
}

impl Block {
    /// Mines a block on top of `pre_block_hash` with a single search thread.
    pub fn new_block(pre_block_hash: Vec<u8>, transactions: &[Transaction]) -> Result<Block> {
        Self::new_block_with_workers(pre_block_hash, transactions, 1)
    }

    pub fn new_block_with_workers(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        workers: usize,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            pre_block_hash,
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
        };

        info!(
            "Starting proof-of-work for block with {} transactions",
            block.transactions.len()
        );
        let pow = ProofOfWork::for_block(&block)?;
        let (nonce, hash) = pow.run_parallel(workers);
        block.nonce = nonce;
        block.hash = hash;
        info!("Proof-of-work completed for block: {}", block.get_hash_hex());

        Ok(block)
    }

    pub fn generate_genesis_block(transaction: &Transaction) -> Result<Block> {
        Block::new_block(vec![], std::slice::from_ref(transaction))
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

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    /// Digest over the serialized transactions, in block order.
    pub fn hash_transactions(&self) -> Result<Vec<u8>> {
        let mut serialized = vec![];
        for transaction in &self.transactions {
            serialized.extend(transaction.serialize()?);
        }
        Ok(sha256_digest(serialized.as_slice()))
    }

    /// Copy with a different nonce but the original stored hash.
    #[cfg(test)]
    pub fn with_nonce(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }

    /// Copy whose parent link points elsewhere; hash and nonce are kept.
    #[cfg(test)]
    pub fn with_pre_block_hash(&self, pre_block_hash: Vec<u8>) -> Block {
        Block {
            pre_block_hash,
            ..self.clone()
        }
    }
}
