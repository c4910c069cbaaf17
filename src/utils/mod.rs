//! Utility functions and helpers
//!
//! Hashing, base58, ECDSA primitives and the bincode helpers shared by the
//! store and the wire protocol.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, public_key_from_pkcs8, ripemd160_digest, sha256_digest, SIGNATURE_LEN,
};

pub use serialization::{deserialize, serialize};
