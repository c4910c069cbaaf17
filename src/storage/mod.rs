//! Data storage and persistence
//!
//! The ledger store keeps blocks and the tip pointer, the UTXO set is the
//! derived spendability index next to it, and the memory pool holds pending
//! transactions of a running node.

pub mod ledger;
pub mod memory_pool;
pub mod utxo_set;

pub use ledger::LedgerStore;
pub use memory_pool::MemoryPool;
pub use utxo_set::{IndexedOutputs, UTXOSet};
