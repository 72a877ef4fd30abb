//! Consensus engines
//!
//! This module produces seals for assembled blocks and verifies the seals on
//! incoming ones: proof-of-work nonce search, proof-of-stake validator
//! checks, and the hybrid selector that weighs between them.

pub mod engine;
pub mod proof_of_stake;
pub mod proof_of_work;

pub use engine::{ConsensusEngine, ConsensusMode};
pub use proof_of_stake::{Validator, ValidatorRegistry};
pub use proof_of_work::ProofOfWork;
