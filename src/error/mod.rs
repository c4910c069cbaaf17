//! Error handling for the ledger
//!
//! Every fallible operation in the crate returns [`Result`]. Validation
//! failures are never swallowed: a caller that receives one of the
//! validation variants must not persist or propagate the offending data.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// Malformed base58 payload or checksum mismatch
    InvalidAddress(String),
    /// UTXO accumulation fell short of the requested amount
    InsufficientFunds { required: u64, available: u64 },
    /// An input references an output that is not in the unspent set
    UnknownInput(String),
    /// A referenced prior transaction was not supplied for signing/verifying
    MissingPriorTransaction(String),
    /// Signature verification failed
    InvalidSignature(String),
    /// `createblockchain` on a store that already has a tip
    AlreadyInitialized,
    /// Chain access on a store without a tip
    NotInitialized,
    /// Transaction or block lookup miss
    NotFound(String),
    /// Underlying persistent store failure
    StoreIo(String),
    /// Structural block problems (linkage, proof-of-work, emptiness)
    InvalidBlock(String),
    /// Malformed transaction construction request
    Transaction(String),
    Crypto(String),
    Wallet(String),
    Network(String),
    Serialization(String),
    Config(String),
    Io(String),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::InvalidAddress(addr) => write!(f, "Invalid address: {addr}"),
            BlockchainError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
            BlockchainError::UnknownInput(msg) => write!(f, "Unknown input: {msg}"),
            BlockchainError::MissingPriorTransaction(txid) => {
                write!(f, "Previous transaction does not exist: {txid}")
            }
            BlockchainError::InvalidSignature(msg) => write!(f, "Invalid signature: {msg}"),
            BlockchainError::AlreadyInitialized => write!(f, "Blockchain already exists"),
            BlockchainError::NotInitialized => {
                write!(f, "No existing blockchain found. Create one first.")
            }
            BlockchainError::NotFound(what) => write!(f, "Not found: {what}"),
            BlockchainError::StoreIo(msg) => write!(f, "Store error: {msg}"),
            BlockchainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            BlockchainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Wallet(msg) => write!(f, "Wallet error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::StoreIo(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Network(err.to_string())
    }
}

impl From<toml::de::Error> for BlockchainError {
    fn from(err: toml::de::Error) -> Self {
        BlockchainError::Config(err.to_string())
    }
}
