use crate::core::{Block, Blockchain, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::locking_hash_from_address;
use data_encoding::HEXLOWER;
use log::{debug, info};
use sled::{Batch, Tree};
use std::collections::{BTreeMap, HashMap};

/// Unspent outputs of one transaction, each with its index in that transaction.
pub type IndexedOutputs = Vec<(usize, TXOutput)>;

/// Index of unspent outputs, derived from the chain and kept in the
/// `chainstate` tree of the same database.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn tree(&self) -> Result<Tree> {
        self.blockchain.store().utxo_tree()
    }

    fn decode_outputs(bytes: &[u8]) -> Result<IndexedOutputs> {
        deserialize(bytes).map_err(|e| {
            BlockchainError::Serialization(format!("Failed to deserialize UTXO entry: {e}"))
        })
    }

    /// Collects outputs locked to `pub_key_hash` until `amount` is covered or
    /// the index runs out. The caller decides whether the total suffices.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0u64;

        for item in self.tree()?.iter() {
            if accumulated >= amount {
                break;
            }
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            for (idx, out) in Self::decode_outputs(v.as_ref())? {
                if out.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += out.get_value();
                    unspent_outputs.entry(txid_hex.clone()).or_default().push(idx);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for item in self.tree()?.iter() {
            let (_, v) = item?;
            utxos.extend(
                Self::decode_outputs(v.as_ref())?
                    .into_iter()
                    .map(|(_, out)| out)
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, address: &str) -> Result<u64> {
        let pub_key_hash = locking_hash_from_address(address)?;
        Ok(self
            .find_utxo(pub_key_hash.as_slice())?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// The unspent output `index` of `txid`, if there is one.
    pub fn find_output(&self, txid: &[u8], index: usize) -> Result<Option<TXOutput>> {
        match self.tree()?.get(txid)? {
            Some(bytes) => Ok(Self::decode_outputs(bytes.as_ref())?
                .into_iter()
                .find(|(idx, _)| *idx == index)
                .map(|(_, out)| out)),
            None => Ok(None),
        }
    }

    /// True while `txid` still has at least one unspent output.
    pub fn contains_transaction(&self, txid: &[u8]) -> Result<bool> {
        Ok(self.tree()?.contains_key(txid)?)
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<usize> {
        let mut counter = 0;
        for item in self.tree()?.iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Whole index, ordered by hex transaction id.
    pub fn snapshot(&self) -> Result<BTreeMap<String, IndexedOutputs>> {
        let mut entries = BTreeMap::new();
        for item in self.tree()?.iter() {
            let (k, v) = item?;
            entries.insert(HEXLOWER.encode(k.as_ref()), Self::decode_outputs(v.as_ref())?);
        }
        Ok(entries)
    }

    /// Rebuilds the index from the chain. The old contents are replaced in
    /// one batch once the new set is complete.
    pub fn reindex(&self) -> Result<()> {
        let utxo_map = self.blockchain.find_utxo()?;
        let utxo_tree = self.tree()?;

        let mut batch = Batch::default();
        for key in utxo_tree.iter().keys() {
            batch.remove(key?);
        }
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            batch.insert(txid, serialize(outs)?);
        }
        utxo_tree.apply_batch(batch)?;

        info!("Reindexed UTXO set: {} transactions", utxo_map.len());
        Ok(())
    }

    /// Applies one newly appended block: spent outputs leave the index and
    /// every output the block creates enters it. Nothing is written if an
    /// input references an output that is not in the index.
    pub fn update(&self, block: &Block) -> Result<()> {
        let utxo_tree = self.tree()?;
        let mut pending: HashMap<Vec<u8>, Option<IndexedOutputs>> = HashMap::new();

        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in tx.get_vin() {
                    let txid = vin.get_txid().to_vec();
                    let outs = match pending.get(&txid) {
                        Some(entry) => entry.clone(),
                        None => match utxo_tree.get(&txid)? {
                            Some(bytes) => Some(Self::decode_outputs(bytes.as_ref())?),
                            None => None,
                        },
                    };

                    let spent = format!("{}:{}", vin.get_txid_hex(), vin.get_vout());
                    let mut outs =
                        outs.ok_or_else(|| BlockchainError::UnknownInput(spent.clone()))?;
                    let position = vin
                        .output_index()
                        .and_then(|index| outs.iter().position(|(idx, _)| *idx == index))
                        .ok_or(BlockchainError::UnknownInput(spent))?;
                    outs.remove(position);

                    pending.insert(txid, if outs.is_empty() { None } else { Some(outs) });
                }
            }

            let new_outputs: IndexedOutputs =
                tx.get_vout().iter().cloned().enumerate().collect();
            pending.insert(tx.get_id_bytes(), Some(new_outputs));
        }

        let mut batch = Batch::default();
        for (txid, outs) in pending {
            match outs {
                Some(outs) => batch.insert(txid, serialize(&outs)?),
                None => batch.remove(txid),
            }
        }
        utxo_tree.apply_batch(batch)?;

        debug!("Applied block {} to UTXO set", block.get_hash_hex());
        Ok(())
    }
}
