//! # Reciprocus
//!
//! A small proof-of-work ledger: value lives in unspent transaction outputs
//! locked to public-key hashes, blocks are chained by hash and admitted by a
//! fixed-difficulty proof of work, and nodes keep each other in sync over a
//! simple TCP protocol.
//!
//! ## Layout
//! - `core/`: blocks, transactions, proof of work and the chain itself
//! - `storage/`: the sled ledger store, the UTXO index and the memory pool
//! - `wallet/`: key pairs, addresses and the wallet file
//! - `network/`: wire packages, per-node protocol state and the TCP server
//! - `config/`: node settings from defaults, a TOML file and the environment
//! - `utils/`: hashing, signatures, base58 and bincode helpers
//! - `cli/`: command-line arguments for the `reciprocus` binary

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{
    Block, Blockchain, BlockchainIterator, ProofOfWork, TXInput, TXOutput, Transaction, SUBSIDY,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Envelope, Node, NodeContext, Nodes, OpType, Package, Server};
pub use storage::{LedgerStore, MemoryPool, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    convert_address, hash_pub_key, locking_hash_from_address, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
