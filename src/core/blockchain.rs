// The chain owns block admission. Blocks live in a sled-backed ledger store;
// the tip hash is cached in memory and every tip-advancing write happens under
// a single writer lock.

use crate::core::{Block, ProofOfWork, TXOutput, Transaction, SUBSIDY};
use crate::error::{BlockchainError, Result};
use crate::storage::{LedgerStore, UTXOSet};
use data_encoding::HEXLOWER;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Unspent outputs keyed by hex transaction id, each with its output index.
pub type UtxoMap = HashMap<String, Vec<(usize, TXOutput)>>;

#[derive(Clone)]
pub struct Blockchain {
    store: LedgerStore,
    tip_hash: Arc<RwLock<Vec<u8>>>,
    writer: Arc<Mutex<()>>,
    mining_workers: usize,
}

impl Blockchain {
    /// Mines a genesis block paying `genesis_address` into a fresh store.
    pub fn create_blockchain(genesis_address: &str, path: impl AsRef<Path>) -> Result<Blockchain> {
        let store = LedgerStore::open(path)?;
        if store.tip()?.is_some() {
            return Err(BlockchainError::AlreadyInitialized);
        }

        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, "Genesis")?;
        let genesis = Block::generate_genesis_block(&coinbase_tx)?;
        store.append(&genesis)?;
        store.flush()?;

        Ok(Self::with_tip(store, genesis.get_hash().to_vec()))
    }

    /// Opens an existing chain.
    pub fn open(path: impl AsRef<Path>) -> Result<Blockchain> {
        let store = LedgerStore::open(path)?;
        let tip = store.tip()?.ok_or(BlockchainError::NotInitialized)?;
        Ok(Self::with_tip(store, tip))
    }

    fn with_tip(store: LedgerStore, tip: Vec<u8>) -> Blockchain {
        Blockchain {
            store,
            tip_hash: Arc::new(RwLock::new(tip)),
            writer: Arc::new(Mutex::new(())),
            mining_workers: 1,
        }
    }

    /// Number of threads used for the nonce search of locally mined blocks.
    pub fn with_mining_workers(mut self, workers: usize) -> Blockchain {
        self.mining_workers = workers.max(1);
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &[u8]) {
        let mut tip_hash = self
            .tip_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *tip_hash = new_tip_hash.to_vec();
    }

    /// Validates `transactions` against the unspent set, mines them on top of
    /// the current tip and makes the result the new tip. The caller applies
    /// the block to the UTXO set afterwards.
    pub fn mine_block(&self, transactions: &[Transaction], utxo_set: &UTXOSet) -> Result<Block> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        Self::check_block_transactions(transactions)?;
        for transaction in transactions {
            self.validate_transaction(transaction, utxo_set)?;
        }

        let block = Block::new_block_with_workers(
            self.get_tip_hash(),
            transactions,
            self.mining_workers,
        )?;
        self.store.append(&block)?;
        self.set_tip_hash(block.get_hash());

        info!(
            "Mined block {} with {} transactions",
            block.get_hash_hex(),
            transactions.len()
        );
        Ok(block)
    }

    /// Admits a block received from a peer. It must extend the current tip,
    /// carry a valid proof of work and only valid transactions. Returns
    /// `false` for an already stored block.
    pub fn add_block(&self, block: &Block, utxo_set: &UTXOSet) -> Result<bool> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        if self.store.contains(block.get_hash())? {
            return Ok(false);
        }
        if block.get_pre_block_hash() != self.get_tip_hash().as_slice() {
            return Err(BlockchainError::InvalidBlock(format!(
                "{} does not extend the current tip",
                block.get_hash_hex()
            )));
        }
        if !ProofOfWork::validate(block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "{} has an invalid proof of work",
                block.get_hash_hex()
            )));
        }

        Self::check_block_transactions(block.get_transactions())?;
        for transaction in block.get_transactions() {
            self.validate_transaction(transaction, utxo_set)?;
        }

        self.store.append(block)?;
        self.set_tip_hash(block.get_hash());
        info!("Added block {}", block.get_hash_hex());
        Ok(true)
    }

    /// Adopts `blocks` (ordered tip to genesis) when it is a valid chain
    /// strictly longer than the local one. The UTXO set must be reindexed
    /// after a successful replacement.
    pub fn replace_chain(&self, blocks: &[Block]) -> Result<bool> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let local_len = self.get_best_height()? + 1;
        if blocks.len() <= local_len {
            return Ok(false);
        }

        Self::validate_candidate_chain(blocks)?;

        let tip = blocks[0].get_hash();
        self.store.replace_all(blocks, tip)?;
        self.set_tip_hash(tip);
        info!(
            "Replaced local chain of {local_len} blocks with {} blocks, tip {}",
            blocks.len(),
            blocks[0].get_hash_hex()
        );
        Ok(true)
    }

    fn validate_candidate_chain(blocks: &[Block]) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(BlockchainError::InvalidBlock(msg)) };

        for (idx, block) in blocks.iter().enumerate() {
            if !ProofOfWork::validate(block) {
                return invalid(format!(
                    "{} has an invalid proof of work",
                    block.get_hash_hex()
                ));
            }
            let linked = match blocks.get(idx + 1) {
                Some(parent) => block.get_pre_block_hash() == parent.get_hash(),
                None => block.is_genesis(),
            };
            if !linked {
                return invalid(format!(
                    "{} is not linked to its parent",
                    block.get_hash_hex()
                ));
            }
        }

        // Replay from genesis so every spend is checked against the outputs
        // that were unspent at that point of the candidate chain.
        let mut known: HashMap<String, Transaction> = HashMap::new();
        let mut unspent: HashMap<(String, usize), u64> = HashMap::new();
        for block in blocks.iter().rev() {
            if let Err(e) = Self::check_block_transactions(block.get_transactions()) {
                return invalid(format!("{}: {e}", block.get_hash_hex()));
            }
            for tx in block.get_transactions() {
                let txid_hex = tx.get_id_hex();
                if known.contains_key(&txid_hex) {
                    return invalid(format!("{txid_hex} appears twice in the chain"));
                }
                let output_total = match Self::output_total(tx) {
                    Ok(total) => total,
                    Err(e) => return invalid(e.to_string()),
                };
                if tx.is_coinbase() {
                    if let Err(e) = Self::check_coinbase(tx) {
                        return invalid(e.to_string());
                    }
                } else {
                    let mut input_total = 0u64;
                    for vin in tx.get_vin() {
                        let value = vin
                            .output_index()
                            .and_then(|index| unspent.remove(&(vin.get_txid_hex(), index)));
                        let Some(value) = value else {
                            return invalid(format!(
                                "{txid_hex} spends {}:{} which is not unspent",
                                vin.get_txid_hex(),
                                vin.get_vout()
                            ));
                        };
                        input_total = match input_total.checked_add(value) {
                            Some(total) => total,
                            None => return invalid(format!("{txid_hex}: input values overflow")),
                        };
                    }
                    if output_total > input_total {
                        return invalid(format!(
                            "{txid_hex} pays {output_total} but only spends {input_total}"
                        ));
                    }
                    match tx.verify(&known) {
                        Ok(true) => {}
                        Ok(false) => return invalid(format!("{txid_hex} fails verification")),
                        Err(e) => return invalid(format!("{txid_hex}: {e}")),
                    }
                }
                for (index, output) in tx.get_vout().iter().enumerate() {
                    unspent.insert((txid_hex.clone(), index), output.get_value());
                }
                known.insert(txid_hex, tx.clone());
            }
        }
        Ok(())
    }

    /// Rules a block's transaction list must follow regardless of chain
    /// state: ids match contents, at most one coinbase and only in first
    /// position, no transaction repeated and no output spent twice.
    fn check_block_transactions(transactions: &[Transaction]) -> Result<()> {
        let mut seen_ids: HashSet<&[u8]> = HashSet::new();
        let mut spent_outputs: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for (position, transaction) in transactions.iter().enumerate() {
            Self::check_transaction_id(transaction)?;
            if !seen_ids.insert(transaction.get_id()) {
                return Err(BlockchainError::Transaction(format!(
                    "{} appears twice in one block",
                    transaction.get_id_hex()
                )));
            }
            if transaction.is_coinbase() {
                if position != 0 {
                    return Err(BlockchainError::Transaction(format!(
                        "Coinbase {} is not the first transaction of its block",
                        transaction.get_id_hex()
                    )));
                }
                continue;
            }
            for input in transaction.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                if !spent_outputs.insert(output_reference) {
                    return Err(BlockchainError::Transaction(format!(
                        "Output {}:{} spent twice in one block",
                        input.get_txid_hex(),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_transaction_id(transaction: &Transaction) -> Result<()> {
        if transaction.hash()? != transaction.get_id() {
            return Err(BlockchainError::Transaction(format!(
                "{}: id does not match contents",
                transaction.get_id_hex()
            )));
        }
        Ok(())
    }

    /// A coinbase pays exactly one output of the block subsidy.
    fn check_coinbase(transaction: &Transaction) -> Result<()> {
        match transaction.get_vout() {
            [output] if output.get_value() == SUBSIDY => Ok(()),
            _ => Err(BlockchainError::Transaction(format!(
                "Coinbase {} must pay a single output of {SUBSIDY}",
                transaction.get_id_hex()
            ))),
        }
    }

    /// Sum of output values, failing on overflow.
    fn output_total(transaction: &Transaction) -> Result<u64> {
        transaction
            .get_vout()
            .iter()
            .try_fold(0u64, |total, output| total.checked_add(output.get_value()))
            .ok_or_else(|| {
                BlockchainError::Transaction(format!(
                    "{}: output values overflow",
                    transaction.get_id_hex()
                ))
            })
    }

    /// The id must match the contents, every input must reference a
    /// distinct unspent output, the outputs may not exceed the inputs and
    /// every signature must verify. A transaction whose id still has unspent
    /// outputs is a duplicate and is refused.
    pub fn validate_transaction(
        &self,
        transaction: &Transaction,
        utxo_set: &UTXOSet,
    ) -> Result<()> {
        Self::check_transaction_id(transaction)?;
        let output_total = Self::output_total(transaction)?;

        if transaction.is_coinbase() {
            Self::check_coinbase(transaction)?;
        } else {
            let mut input_total = 0u64;
            let mut referenced: HashSet<(&[u8], i64)> = HashSet::new();
            for input in transaction.get_vin() {
                let spent = format!("{}:{}", input.get_txid_hex(), input.get_vout());
                if !referenced.insert((input.get_txid(), input.get_vout())) {
                    return Err(BlockchainError::Transaction(format!(
                        "{} spends {spent} twice",
                        transaction.get_id_hex()
                    )));
                }
                let output = match input.output_index() {
                    Some(index) => utxo_set.find_output(input.get_txid(), index)?,
                    None => None,
                };
                let output = output.ok_or(BlockchainError::UnknownInput(spent))?;
                input_total = input_total.checked_add(output.get_value()).ok_or_else(|| {
                    BlockchainError::Transaction(format!(
                        "{}: input values overflow",
                        transaction.get_id_hex()
                    ))
                })?;
            }
            if output_total > input_total {
                return Err(BlockchainError::Transaction(format!(
                    "{} pays {output_total} but only spends {input_total}",
                    transaction.get_id_hex()
                )));
            }
        }

        if utxo_set.contains_transaction(transaction.get_id())? {
            return Err(BlockchainError::Transaction(format!(
                "{} duplicates a transaction with unspent outputs",
                transaction.get_id_hex()
            )));
        }

        if !self.verify_transaction(transaction)? {
            return Err(BlockchainError::InvalidSignature(transaction.get_id_hex()));
        }
        Ok(())
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator::new(self.get_tip_hash(), self.store.clone())
    }

    /// Replays the whole chain and returns every output no input spends.
    pub fn find_utxo(&self) -> Result<UtxoMap> {
        let mut utxo: UtxoMap = HashMap::new();
        let mut spent_txos: HashMap<String, Vec<usize>> = HashMap::new();

        for block in self.iterator() {
            let block = block?;
            // Newest first, so a spend is always seen before the output it consumes.
            for tx in block.get_transactions().iter().rev() {
                let txid_hex = tx.get_id_hex();
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    let spent = spent_txos
                        .get(&txid_hex)
                        .is_some_and(|outs| outs.contains(&idx));
                    if !spent {
                        utxo.entry(txid_hex.clone())
                            .or_default()
                            .push((idx, out.clone()));
                    }
                }
                if tx.is_coinbase() {
                    continue;
                }

                for txin in tx.get_vin() {
                    if let Some(index) = txin.output_index() {
                        spent_txos.entry(txin.get_txid_hex()).or_default().push(index);
                    }
                }
            }
        }

        for outs in utxo.values_mut() {
            outs.sort_by_key(|(idx, _)| *idx);
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Transaction> {
        for block in self.iterator() {
            let block = block?;
            if let Some(transaction) = block
                .get_transactions()
                .iter()
                .find(|transaction| transaction.get_id() == txid)
            {
                return Ok(transaction.clone());
            }
        }
        Err(BlockchainError::NotFound(format!(
            "transaction {}",
            HEXLOWER.encode(txid)
        )))
    }

    /// Confirmed transactions referenced by `transaction`'s inputs, keyed by
    /// hex id. References that are not on chain are left out.
    pub fn prior_transactions(
        &self,
        transaction: &Transaction,
    ) -> Result<HashMap<String, Transaction>> {
        let mut wanted: HashSet<String> = HashSet::new();
        if !transaction.is_coinbase() {
            wanted.extend(transaction.get_vin().iter().map(|vin| vin.get_txid_hex()));
        }

        let mut prev_txs = HashMap::new();
        if wanted.is_empty() {
            return Ok(prev_txs);
        }
        for block in self.iterator() {
            let block = block?;
            for tx in block.get_transactions() {
                let txid_hex = tx.get_id_hex();
                if wanted.remove(&txid_hex) {
                    prev_txs.insert(txid_hex, tx.clone());
                }
            }
            if wanted.is_empty() {
                break;
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, transaction: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        let prev_txs = self.prior_transactions(transaction)?;
        transaction.sign(pkcs8, &prev_txs)
    }

    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool> {
        if transaction.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.prior_transactions(transaction)?;
        transaction.verify(&prev_txs)
    }

    /// Height of the tip; the genesis block has height 0.
    pub fn get_best_height(&self) -> Result<usize> {
        let mut count: usize = 0;
        for block in self.iterator() {
            block?;
            count += 1;
        }
        Ok(count.saturating_sub(1))
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        self.store.get_block(block_hash)
    }

    pub fn has_block(&self, block_hash: &[u8]) -> Result<bool> {
        self.store.contains(block_hash)
    }

    /// Block hashes from tip to genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        self.iterator()
            .map(|block| block.map(|block| block.get_hash().to_vec()))
            .collect()
    }
}

/// Walks the chain from a starting hash back to genesis.
pub struct BlockchainIterator {
    store: LedgerStore,
    current_hash: Option<Vec<u8>>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, store: LedgerStore) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: Some(tip_hash),
            store,
        }
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let current_hash = self.current_hash.take()?;
        match self.store.get_block(&current_hash) {
            Ok(Some(block)) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_pre_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Ok(None) => {
                warn!(
                    "Chain references missing block {}",
                    HEXLOWER.encode(&current_hash)
                );
                Some(Err(BlockchainError::NotFound(format!(
                    "block {}",
                    HEXLOWER.encode(&current_hash)
                ))))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use tempfile::tempdir;

    fn new_chain(path: &Path) -> (Blockchain, UTXOSet, Wallet) {
        let wallet = Wallet::new().unwrap();
        let blockchain = Blockchain::create_blockchain(&wallet.get_address(), path).unwrap();
        let utxo_set = UTXOSet::new(blockchain.clone());
        utxo_set.reindex().unwrap();
        (blockchain, utxo_set, wallet)
    }

    fn mine_reward(blockchain: &Blockchain, utxo_set: &UTXOSet, to: &str) -> Block {
        let coinbase = Transaction::new_coinbase_tx(to, "").unwrap();
        let block = blockchain.mine_block(&[coinbase], utxo_set).unwrap();
        utxo_set.update(&block).unwrap();
        block
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let first = Blockchain::create_blockchain(&address, dir.path()).unwrap();
        drop(first);

        let second = Blockchain::create_blockchain(&address, dir.path());
        assert!(matches!(second, Err(BlockchainError::AlreadyInitialized)));
    }

    #[test]
    fn test_open_without_chain() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Blockchain::open(dir.path()),
            Err(BlockchainError::NotInitialized)
        ));
    }

    #[test]
    fn test_iterator_ends_at_single_genesis() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, wallet) = new_chain(dir.path());
        mine_reward(&blockchain, &utxo_set, &wallet.get_address());
        mine_reward(&blockchain, &utxo_set, &wallet.get_address());

        let blocks: Vec<Block> = blockchain.iterator().collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks.iter().filter(|b| b.is_genesis()).count(), 1);
        assert!(blocks[2].is_genesis());
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].get_pre_block_hash(), pair[1].get_hash());
        }
        assert_eq!(blockchain.get_best_height().unwrap(), 2);
        assert_eq!(blocks[0].get_hash(), blockchain.get_tip_hash().as_slice());

        // Iterators restart from the tip on every call
        assert_eq!(blockchain.iterator().count(), 3);
    }

    #[test]
    fn test_find_transaction() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, wallet) = new_chain(dir.path());
        let block = mine_reward(&blockchain, &utxo_set, &wallet.get_address());
        let coinbase = &block.get_transactions()[0];

        assert_eq!(
            blockchain.find_transaction(coinbase.get_id()).unwrap(),
            *coinbase
        );
        assert!(matches!(
            blockchain.find_transaction(&[0u8; 32]),
            Err(BlockchainError::NotFound(_))
        ));
    }

    #[test]
    fn test_mine_rejects_spent_input() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let bob = Wallet::new().unwrap();

        let tx = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 40, &utxo_set)
            .unwrap();
        let block = blockchain.mine_block(&[tx.clone()], &utxo_set).unwrap();
        utxo_set.update(&block).unwrap();

        let again = blockchain.mine_block(&[tx], &utxo_set);
        assert!(matches!(again, Err(BlockchainError::UnknownInput(_))));
        assert_eq!(blockchain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_mine_rejects_in_block_double_spend() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let bob = Wallet::new().unwrap();

        let tx = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 40, &utxo_set)
            .unwrap();
        let result = blockchain.mine_block(&[tx.clone(), tx], &utxo_set);
        assert!(matches!(result, Err(BlockchainError::Transaction(_))));
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_add_block_from_peer() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let (chain_a, utxo_a, wallet) = new_chain(dir_a.path());

        // Node B starts from the same genesis
        let genesis = chain_a.get_block(&chain_a.get_tip_hash()).unwrap().unwrap();
        {
            let store_b = LedgerStore::open(dir_b.path()).unwrap();
            store_b.append(&genesis).unwrap();
            store_b.flush().unwrap();
        }
        let chain_b = Blockchain::open(dir_b.path()).unwrap();
        let utxo_b = UTXOSet::new(chain_b.clone());
        utxo_b.reindex().unwrap();

        let block = mine_reward(&chain_a, &utxo_a, &wallet.get_address());
        assert!(chain_b.add_block(&block, &utxo_b).unwrap());
        assert!(!chain_b.add_block(&block, &utxo_b).unwrap());
        assert_eq!(chain_b.get_tip_hash(), block.get_hash());
    }

    #[test]
    fn test_add_block_rejects_unlinked_and_tampered() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, wallet) = new_chain(dir.path());
        let tip = blockchain.get_tip_hash();

        let coinbase = Transaction::new_coinbase_tx(&wallet.get_address(), "").unwrap();
        let orphan = Block::new_block(vec![9; 32], &[coinbase.clone()]).unwrap();
        assert!(matches!(
            blockchain.add_block(&orphan, &utxo_set),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let good = Block::new_block(tip.clone(), &[coinbase]).unwrap();
        let tampered = good.with_nonce(good.get_nonce() + 1);
        assert!(matches!(
            blockchain.add_block(&tampered, &utxo_set),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(blockchain.get_tip_hash(), tip);
    }

    #[test]
    fn test_replace_chain_requires_longer_valid_chain() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let (chain_a, utxo_a, wallet_a) = new_chain(dir_a.path());
        let (chain_b, utxo_b, wallet_b) = new_chain(dir_b.path());
        for _ in 0..3 {
            mine_reward(&chain_a, &utxo_a, &wallet_a.get_address());
        }
        mine_reward(&chain_b, &utxo_b, &wallet_b.get_address());

        let longer: Vec<Block> = chain_a.iterator().collect::<Result<_>>().unwrap();
        let shorter: Vec<Block> = chain_b.iterator().collect::<Result<_>>().unwrap();
        assert_eq!((longer.len(), shorter.len()), (4, 2));
        assert!(!chain_a.replace_chain(&shorter).unwrap());

        // Still longer than B after dropping a block, but no longer linked
        let mut broken = longer.clone();
        broken.remove(1);
        assert_eq!(broken.len(), 3);
        assert!(matches!(
            chain_b.replace_chain(&broken),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain_b.get_block_hashes().unwrap().len(), 2);

        assert!(chain_b.replace_chain(&longer).unwrap());
        assert_eq!(chain_b.get_tip_hash(), chain_a.get_tip_hash());
        assert_eq!(
            chain_b.get_block_hashes().unwrap(),
            chain_a.get_block_hashes().unwrap()
        );
        assert!(!chain_b.has_block(shorter[0].get_hash()).unwrap());
    }

    #[test]
    fn test_replace_chain_rejects_double_spend_across_blocks() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let (chain_a, utxo_a, alice) = new_chain(dir_a.path());
        let (chain_b, _utxo_b, _) = new_chain(dir_b.path());
        let bob = Wallet::new().unwrap();
        let carol = Wallet::new().unwrap();

        // Both spend the genesis reward; neither is applied to A
        let to_bob =
            Transaction::new_utxo_transaction(&alice, &bob.get_address(), 10, &utxo_a).unwrap();
        let to_carol =
            Transaction::new_utxo_transaction(&alice, &carol.get_address(), 10, &utxo_a).unwrap();
        assert_eq!(to_bob.get_vin()[0].get_txid(), to_carol.get_vin()[0].get_txid());

        let reward = |to: &Wallet| Transaction::new_coinbase_tx(&to.get_address(), "").unwrap();
        let first = Block::new_block(chain_a.get_tip_hash(), &[reward(&alice), to_bob]).unwrap();
        let second =
            Block::new_block(first.get_hash().to_vec(), &[reward(&alice), to_carol]).unwrap();

        let mut candidate = vec![second, first];
        candidate.extend(chain_a.iterator().collect::<Result<Vec<_>>>().unwrap());
        assert!(matches!(
            chain_b.replace_chain(&candidate),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain_b.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_replace_chain_rejects_inflating_transaction() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let (chain_a, utxo_a, alice) = new_chain(dir_a.path());
        let (chain_b, _utxo_b, _) = new_chain(dir_b.path());
        let genesis_reward = chain_a.find_utxo().unwrap().into_keys().next().unwrap();
        let genesis_reward = HEXLOWER.decode(genesis_reward.as_bytes()).unwrap();

        let inflated = Transaction::signed_transfer(
            &alice,
            &[(genesis_reward, 0)],
            vec![TXOutput::new(SUBSIDY * 5, &alice.get_address()).unwrap()],
            &utxo_a,
        )
        .unwrap();
        let coinbase = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let block = Block::new_block(chain_a.get_tip_hash(), &[coinbase, inflated]).unwrap();

        let mut candidate = vec![block];
        candidate.extend(chain_a.iterator().collect::<Result<Vec<_>>>().unwrap());
        assert!(matches!(
            chain_b.replace_chain(&candidate),
            Err(BlockchainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_add_block_rejects_reused_transaction_id() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let mallory = Wallet::new().unwrap();
        let before = utxo_set.snapshot().unwrap();
        let genesis_id = HEXLOWER
            .decode(before.keys().next().unwrap().as_bytes())
            .unwrap();

        // Id copied from the genesis reward, contents paying someone else
        let forged = Transaction::new_coinbase_tx(&mallory.get_address(), "")
            .unwrap()
            .with_id(genesis_id);
        let block = Block::new_block(blockchain.get_tip_hash(), &[forged]).unwrap();
        assert!(matches!(
            blockchain.add_block(&block, &utxo_set),
            Err(BlockchainError::Transaction(_))
        ));

        // Honest hash, but identical to the still unspent genesis reward
        let replayed = Transaction::new_coinbase_tx(&alice.get_address(), "Genesis").unwrap();
        let block = Block::new_block(blockchain.get_tip_hash(), &[replayed]).unwrap();
        assert!(matches!(
            blockchain.add_block(&block, &utxo_set),
            Err(BlockchainError::Transaction(_))
        ));

        assert_eq!(blockchain.get_best_height().unwrap(), 0);
        assert_eq!(utxo_set.snapshot().unwrap(), before);
        utxo_set.reindex().unwrap();
        assert_eq!(utxo_set.snapshot().unwrap(), before);
        assert_eq!(utxo_set.get_balance(&alice.get_address()).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_coinbase_placement_and_value() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let bob = Wallet::new().unwrap();
        let reward = || Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
        let spend =
            Transaction::new_utxo_transaction(&alice, &bob.get_address(), 10, &utxo_set).unwrap();

        for transactions in [
            vec![spend.clone(), reward()],
            vec![reward(), reward()],
            vec![reward().with_first_output_value(SUBSIDY * 2)],
        ] {
            assert!(matches!(
                blockchain.mine_block(&transactions, &utxo_set),
                Err(BlockchainError::Transaction(_))
            ));
        }
        assert_eq!(blockchain.get_best_height().unwrap(), 0);

        let block = blockchain.mine_block(&[reward(), spend], &utxo_set).unwrap();
        utxo_set.update(&block).unwrap();
        assert_eq!(utxo_set.get_balance(&bob.get_address()).unwrap(), 10);
    }

    #[test]
    fn test_outputs_may_not_exceed_inputs() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let genesis = blockchain
            .get_block(&blockchain.get_tip_hash())
            .unwrap()
            .unwrap();
        let genesis_reward = genesis.get_transactions()[0].get_id_bytes();

        let inflated = Transaction::signed_transfer(
            &alice,
            &[(genesis_reward.clone(), 0)],
            vec![TXOutput::new(SUBSIDY + 1, &alice.get_address()).unwrap()],
            &utxo_set,
        )
        .unwrap();
        assert!(matches!(
            blockchain.validate_transaction(&inflated, &utxo_set),
            Err(BlockchainError::Transaction(_))
        ));

        let overflowing = Transaction::signed_transfer(
            &alice,
            &[(genesis_reward.clone(), 0)],
            vec![
                TXOutput::new(u64::MAX, &alice.get_address()).unwrap(),
                TXOutput::new(2, &alice.get_address()).unwrap(),
            ],
            &utxo_set,
        )
        .unwrap();
        assert!(matches!(
            blockchain.mine_block(&[overflowing], &utxo_set),
            Err(BlockchainError::Transaction(_))
        ));

        // The same output listed twice does not count twice
        let doubled = Transaction::signed_transfer(
            &alice,
            &[(genesis_reward.clone(), 0), (genesis_reward, 0)],
            vec![TXOutput::new(SUBSIDY * 2, &alice.get_address()).unwrap()],
            &utxo_set,
        )
        .unwrap();
        assert!(matches!(
            blockchain.validate_transaction(&doubled, &utxo_set),
            Err(BlockchainError::Transaction(_))
        ));
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_find_utxo_skips_spent_outputs() {
        let dir = tempdir().unwrap();
        let (blockchain, utxo_set, alice) = new_chain(dir.path());
        let bob = Wallet::new().unwrap();

        let tx = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 30, &utxo_set)
            .unwrap();
        let block = blockchain.mine_block(&[tx.clone()], &utxo_set).unwrap();
        utxo_set.update(&block).unwrap();

        let utxo = blockchain.find_utxo().unwrap();
        assert_eq!(utxo.len(), 1);
        let outs = &utxo[&tx.get_id_hex()];
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].0, 0);
        assert_eq!(outs[0].1.get_value(), 30);
        assert_eq!(outs[1].1.get_value(), 70);
    }
}
