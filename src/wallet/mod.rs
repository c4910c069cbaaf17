//! Wallet management and address handling
//!
//! Key pairs live here together with the address codec (base58 with a
//! version byte and a double-SHA-256 checksum).

#[allow(clippy::module_inception)]
pub mod wallet;
pub mod wallets;

pub use wallet::{
    convert_address, hash_pub_key, locking_hash_from_address, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
pub use wallets::{Wallets, WALLET_FILE};
