use crate::core::Block;
use crate::error::Result;
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::debug;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

/// Leading zero bits a block hash must carry.
pub const TARGET_BITS: u32 = 16;

/// `2^(256 - TARGET_BITS)`
static TARGET: Lazy<BigUint> = Lazy::new(|| BigUint::from(1u8) << (256 - TARGET_BITS) as usize);

/// Nonce search over the header fields of one candidate block.
pub struct ProofOfWork {
    pre_block_hash: Vec<u8>,
    tx_digest: Vec<u8>,
}

impl ProofOfWork {
    pub fn new_proof_of_work(pre_block_hash: &[u8], tx_digest: &[u8]) -> ProofOfWork {
        ProofOfWork {
            pre_block_hash: pre_block_hash.to_vec(),
            tx_digest: tx_digest.to_vec(),
        }
    }

    pub fn for_block(block: &Block) -> Result<ProofOfWork> {
        let tx_digest = block.hash_transactions()?;
        Ok(Self::new_proof_of_work(block.get_pre_block_hash(), &tx_digest))
    }

    pub fn target() -> &'static BigUint {
        &TARGET
    }

    /// Recomputes the hash from the block's stored nonce; the hash must both
    /// match the stored one and fall below the target.
    pub fn validate(block: &Block) -> bool {
        let pow = match Self::for_block(block) {
            Ok(pow) => pow,
            Err(e) => {
                debug!("Cannot rebuild proof-of-work input: {e}");
                return false;
            }
        };
        let hash = pow.hash_with_nonce(block.get_nonce());
        hash.as_slice() == block.get_hash() && Self::meets_target(&hash)
    }

    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.pre_block_hash.len() + 40);
        data_bytes.extend(self.pre_block_hash.as_slice());
        data_bytes.extend(self.tx_digest.as_slice());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    fn hash_with_nonce(&self, nonce: i64) -> Vec<u8> {
        sha256_digest(self.prepare_data(nonce).as_slice())
    }

    fn meets_target(hash: &[u8]) -> bool {
        BigUint::from_bytes_be(hash) < *TARGET
    }

    /// Tries nonces from 0 upward and returns the first one whose hash is
    /// below the target.
    pub fn run(&self) -> (i64, Vec<u8>) {
        let mut nonce: i64 = 0;
        loop {
            let hash = self.hash_with_nonce(nonce);
            if Self::meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return (nonce, hash);
            }
            nonce += 1;
        }
    }

    /// Splits the nonce space across `workers` threads; worker `w` tries
    /// `w, w + workers, ...`. The first hit stops every worker.
    pub fn run_parallel(&self, workers: usize) -> (i64, Vec<u8>) {
        if workers <= 1 {
            return self.run();
        }

        let found = AtomicBool::new(false);
        let winner: Mutex<Option<(i64, Vec<u8>)>> = Mutex::new(None);
        let stride = workers as i64;

        thread::scope(|scope| {
            for worker in 0..workers {
                let found = &found;
                let winner = &winner;
                scope.spawn(move || {
                    let mut nonce = worker as i64;
                    while !found.load(Ordering::Relaxed) {
                        let hash = self.hash_with_nonce(nonce);
                        if Self::meets_target(&hash) {
                            if !found.swap(true, Ordering::AcqRel) {
                                if let Ok(mut slot) = winner.lock() {
                                    *slot = Some((nonce, hash));
                                }
                            }
                            break;
                        }
                        nonce += stride;
                    }
                });
            }
        });

        match winner.into_inner().ok().flatten() {
            Some(result) => {
                debug!(
                    "Found nonce {} with {workers} workers: {}",
                    result.0,
                    HEXLOWER.encode(&result.1)
                );
                result
            }
            // A poisoned slot means a worker panicked after winning; redo serially.
            None => self.run(),
        }
    }
}
