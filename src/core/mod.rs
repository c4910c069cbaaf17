//! Core blockchain functionality
//!
//! Blocks, transactions, the chain itself and the proof-of-work rule that
//! admits blocks into it.

pub mod block;
pub mod blockchain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator, UtxoMap};
pub use proof_of_work::{ProofOfWork, TARGET_BITS};
pub use transaction::{TXInput, TXOutput, Transaction, SUBSIDY};
