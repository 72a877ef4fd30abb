use crate::core::Block;
use crate::error::{NodeError, Result};
use crate::utils::sha256_digest;
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;
use std::sync::atomic::{AtomicBool, Ordering};

// A difficulty of d requires d leading zero nibbles, 4 bits each
const BITS_PER_NIBBLE: u32 = 4;
// How often the nonce loop checks the cancel flag
const CANCEL_CHECK_INTERVAL: i64 = 1024;

pub struct ProofOfWork {
    target: BigInt,
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> ProofOfWork {
        let mut target = BigInt::from(1);
        target.shl_assign(256 - difficulty * BITS_PER_NIBBLE);
        ProofOfWork { target, difficulty }
    }

    /// Search for a nonce whose hash clears the target. Bounded by `budget`
    /// attempts and cancellable between batches, so a peer block that
    /// advances the chain can abort a stale attempt.
    pub fn seal(&self, block: &mut Block, cancel: &AtomicBool, budget: u64) -> Result<()> {
        let max_nonce = i64::try_from(budget)
            .map_err(|_| NodeError::Config("sealing budget exceeds nonce space".to_string()))?;

        let mut nonce = 0;
        while nonce < max_nonce {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(NodeError::Resource(
                    "sealing cancelled by a newer head".to_string(),
                ));
            }

            let hash = sha256_digest(&block.header_bytes(nonce));
            let hash_int = BigInt::from_bytes_be(Sign::Plus, &hash);

            if hash_int < self.target {
                block.set_seal(nonce, block.compute_hash(nonce));
                return Ok(());
            }
            nonce += 1;
        }

        Err(NodeError::Resource(format!(
            "sealing budget of {budget} attempts exhausted at difficulty {}",
            self.difficulty
        )))
    }

    /// Validate proof-of-work for a block: the recorded hash must match the
    /// header under the recorded nonce and clear the difficulty target.
    pub fn validate(block: &Block) -> bool {
        if block.compute_hash(block.get_nonce()) != block.get_hash() {
            return false;
        }

        let pow = ProofOfWork::new(block.get_difficulty());
        let hash = sha256_digest(&block.header_bytes(block.get_nonce()));
        let hash_int = BigInt::from_bytes_be(Sign::Plus, &hash);

        hash_int < pow.target
    }
}
