use crate::core::{Block, Transaction};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Pending transactions waiting for a mining round.
/// ( K -> txid_hex, V => Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    // A panicked writer leaves the map itself intact, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Transaction>> {
        self.inner.read().unwrap_or_else(|poisoned| {
            log::error!("Memory pool lock was poisoned");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Transaction>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            log::error!("Memory pool lock was poisoned");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn get(&self, txid: &str) -> Option<Transaction> {
        self.read().get(txid).cloned()
    }

    /// Inserts `tx`; returns `false` if it was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        let mut pool = self.write();
        let txid_hex = tx.get_id_hex();
        if pool.contains_key(&txid_hex) {
            return false;
        }
        pool.insert(txid_hex, tx);
        true
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.read().contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Empties the pool and hands back everything it held.
    pub fn take_all(&self) -> Vec<Transaction> {
        self.write().drain().map(|(_, tx)| tx).collect()
    }

    /// Puts transactions back after a failed mining round. Entries that
    /// arrived in the meantime are kept.
    pub fn restore(&self, transactions: Vec<Transaction>) {
        let mut pool = self.write();
        for tx in transactions {
            pool.entry(tx.get_id_hex()).or_insert(tx);
        }
    }

    /// Drops every pooled transaction confirmed by `block`.
    pub fn remove_confirmed(&self, block: &Block) {
        let mut pool = self.write();
        for tx in block.get_transactions() {
            pool.remove(&tx.get_id_hex());
        }
    }

    /// True if a pooled transaction already spends one of `tx`'s inputs.
    pub fn conflicts_with(&self, tx: &Transaction) -> bool {
        let pool = self.read();
        tx.get_vin().iter().any(|vin| {
            pool.values().any(|pooled| {
                pooled.get_vin().iter().any(|other| {
                    other.get_txid() == vin.get_txid() && other.get_vout() == vin.get_vout()
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        let address = Wallet::new().unwrap().get_address();
        Transaction::new_coinbase_tx(&address, "").unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let pool = MemoryPool::new();
        let tx = coinbase();

        assert!(pool.add(tx.clone()));
        assert!(!pool.add(tx.clone()));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx.get_id_hex()));
        assert_eq!(pool.get(&tx.get_id_hex()), Some(tx));
    }

    #[test]
    fn test_take_all_empties_pool() {
        let pool = MemoryPool::new();
        pool.add(coinbase());
        pool.add(coinbase());

        let taken = pool.take_all();
        assert_eq!(taken.len(), 2);
        assert!(pool.is_empty());

        let late = coinbase();
        pool.add(late.clone());
        pool.restore(taken);
        assert_eq!(pool.len(), 3);
        assert!(pool.contains(&late.get_id_hex()));
    }

    #[test]
    fn test_conflicting_inputs_are_detected() {
        let pool = MemoryPool::new();
        let first = coinbase();
        // Two coinbase inputs share the empty outpoint
        pool.add(first);
        assert!(pool.conflicts_with(&coinbase()));

        pool.take_all();
        assert!(!pool.conflicts_with(&coinbase()));
    }
}
