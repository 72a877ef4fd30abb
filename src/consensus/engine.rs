use crate::consensus::proof_of_stake::ProofOfStake;
use crate::consensus::{ProofOfWork, ValidatorRegistry};
use crate::core::monetary::BASE_BLOCK_REWARD;
use crate::core::{Block, ConsensusTag, DifficultyAdjustment};
use crate::error::{NodeError, Result};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

/// Which engines a node runs. Pure modes bypass the hybrid selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Pow,
    Pos,
    Hybrid,
}

/// Seals assembled blocks and verifies the seals on incoming ones
///
/// Hybrid mode draws pow or pos per sealing attempt, biased by the
/// configured weights; the chosen engine's tag is recorded on the block and
/// verification dispatches on that tag alone.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    mode: ConsensusMode,
    pow_weight: f64,
    sealing_budget: u64,
}

impl ConsensusEngine {
    pub fn new(mode: ConsensusMode, pow_weight: f64, sealing_budget: u64) -> ConsensusEngine {
        ConsensusEngine {
            mode,
            pow_weight,
            sealing_budget,
        }
    }

    pub fn mode(&self) -> ConsensusMode {
        self.mode
    }

    fn pick_tag<R: Rng>(&self, rng: &mut R) -> ConsensusTag {
        match self.mode {
            ConsensusMode::Pow => ConsensusTag::Pow,
            ConsensusMode::Pos => ConsensusTag::Pos,
            ConsensusMode::Hybrid => {
                if rng.gen::<f64>() < self.pow_weight {
                    ConsensusTag::Pow
                } else {
                    ConsensusTag::Pos
                }
            }
        }
    }

    fn tag_allowed(&self, tag: ConsensusTag) -> bool {
        match self.mode {
            ConsensusMode::Pow => tag == ConsensusTag::Pow,
            ConsensusMode::Pos => tag == ConsensusTag::Pos,
            ConsensusMode::Hybrid => true,
        }
    }

    /// Seal an assembled block on behalf of `miner`.
    ///
    /// A pos attempt only succeeds when the stake-weighted draw lands on the
    /// miner itself; losing the draw is a retryable Resource condition, not
    /// a failure. A pow attempt runs the bounded, cancellable nonce search.
    pub fn seal<R: Rng>(
        &self,
        block: &mut Block,
        registry: &ValidatorRegistry,
        miner: &str,
        cancel: &AtomicBool,
        rng: &mut R,
    ) -> Result<()> {
        let tag = self.pick_tag(rng);
        debug!("Sealing block {} via {tag}", block.get_index());

        match tag {
            ConsensusTag::Pow => {
                block.set_consensus_tag(ConsensusTag::Pow);
                ProofOfWork::new(block.get_difficulty()).seal(block, cancel, self.sealing_budget)
            }
            ConsensusTag::Pos => {
                let selected = registry.select_proposer(rng).ok_or_else(|| {
                    NodeError::Resource("no active validators for proof-of-stake".to_string())
                })?;
                if selected != miner {
                    return Err(NodeError::Resource(format!(
                        "proposer draw selected {selected}"
                    )));
                }
                block.set_consensus_tag(ConsensusTag::Pos);
                ProofOfStake::seal(block, registry)
            }
        }
    }

    /// Verify the seal on an incoming block, dispatching on its tag
    pub fn verify_seal(&self, block: &Block, registry: &ValidatorRegistry) -> Result<()> {
        if !self.tag_allowed(block.get_consensus_tag()) {
            return Err(NodeError::Consensus(format!(
                "block sealed via {} but this node runs {:?}",
                block.get_consensus_tag(),
                self.mode
            )));
        }

        match block.get_consensus_tag() {
            ConsensusTag::Pow => {
                DifficultyAdjustment::validate_difficulty(block.get_difficulty())?;
                if !ProofOfWork::validate(block) {
                    return Err(NodeError::Consensus(format!(
                        "block {} fails proof-of-work at difficulty {}",
                        block.get_hash(),
                        block.get_difficulty()
                    )));
                }
                Ok(())
            }
            ConsensusTag::Pos => {
                if !ProofOfStake::validate(block, registry) {
                    return Err(NodeError::Consensus(format!(
                        "block {} proposer {} fails proof-of-stake",
                        block.get_hash(),
                        block.get_proposer()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Base reward for the proposer, before fees. Pow pays the full base
    /// reward; pos pays the base reward scaled by the proposer's share of
    /// active stake, both deterministic from chain-derived state.
    pub fn block_reward(&self, block: &Block, registry: &ValidatorRegistry) -> u64 {
        match block.get_consensus_tag() {
            ConsensusTag::Pow => BASE_BLOCK_REWARD,
            ConsensusTag::Pos => {
                let total = registry.total_active_stake();
                let stake = registry
                    .get(block.get_proposer())
                    .map(|v| v.stake)
                    .unwrap_or(0);
                if total == 0 {
                    return 0;
                }
                ((BASE_BLOCK_REWARD as u128 * stake as u128) / total as u128) as u64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unsealed_block(difficulty: u32, proposer: &str) -> Block {
        let tx = TransactionBuilder::standard("alice", "bob", 1, 0).unwrap();
        Block::new("parent".to_string(), &[tx], 1, difficulty, proposer).unwrap()
    }

    fn staked_registry(address: &str, stake: u64) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new(1_000);
        registry.register_stake(address, stake);
        registry
    }

    #[test]
    fn test_pure_pow_seals_and_verifies() {
        let engine = ConsensusEngine::new(ConsensusMode::Pow, 1.0, 1_000_000);
        let registry = ValidatorRegistry::new(1_000);
        let mut block = unsealed_block(1, "miner");
        let cancel = AtomicBool::new(false);
        let mut rng = StdRng::seed_from_u64(1);

        engine
            .seal(&mut block, &registry, "miner", &cancel, &mut rng)
            .unwrap();
        assert_eq!(block.get_consensus_tag(), ConsensusTag::Pow);
        engine.verify_seal(&block, &registry).unwrap();
    }

    #[test]
    fn test_pure_pos_requires_active_proposer() {
        let engine = ConsensusEngine::new(ConsensusMode::Pos, 0.0, 1_000_000);
        let registry = staked_registry("staker", 5_000);
        let cancel = AtomicBool::new(false);
        let mut rng = StdRng::seed_from_u64(1);

        let mut block = unsealed_block(1, "staker");
        engine
            .seal(&mut block, &registry, "staker", &cancel, &mut rng)
            .unwrap();
        assert_eq!(block.get_consensus_tag(), ConsensusTag::Pos);
        engine.verify_seal(&block, &registry).unwrap();

        // An unstaked miner can never win the draw
        let mut other = unsealed_block(1, "nobody");
        let result = engine.seal(&mut other, &registry, "nobody", &cancel, &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn test_pos_verification_rejects_unknown_proposer() {
        let engine = ConsensusEngine::new(ConsensusMode::Pos, 0.0, 1_000_000);
        let registry = staked_registry("staker", 5_000);

        let mut block = unsealed_block(1, "impostor");
        block.set_consensus_tag(ConsensusTag::Pos);
        assert!(engine.verify_seal(&block, &registry).is_err());
    }

    #[test]
    fn test_pure_mode_rejects_foreign_tag() {
        let pow_engine = ConsensusEngine::new(ConsensusMode::Pow, 1.0, 1_000_000);
        let registry = staked_registry("staker", 5_000);

        let mut block = unsealed_block(1, "staker");
        block.set_consensus_tag(ConsensusTag::Pos);
        assert!(pow_engine.verify_seal(&block, &registry).is_err());
    }

    #[test]
    fn test_hybrid_draw_respects_weights() {
        let engine = ConsensusEngine::new(ConsensusMode::Hybrid, 0.3, 1_000_000);
        let mut rng = StdRng::seed_from_u64(42);

        let mut pow_picks = 0;
        for _ in 0..1_000 {
            if engine.pick_tag(&mut rng) == ConsensusTag::Pow {
                pow_picks += 1;
            }
        }
        // Expect roughly 300 of 1000
        assert!((200..400).contains(&pow_picks), "pow picked {pow_picks}");
    }

    #[test]
    fn test_rewards_per_engine() {
        let engine = ConsensusEngine::new(ConsensusMode::Hybrid, 0.3, 1_000_000);
        let mut registry = staked_registry("staker", 3_000);
        registry.register_stake("whale", 9_000);

        let mut pow_block = unsealed_block(1, "anyone");
        pow_block.set_consensus_tag(ConsensusTag::Pow);
        assert_eq!(engine.block_reward(&pow_block, &registry), BASE_BLOCK_REWARD);

        let mut pos_block = unsealed_block(1, "staker");
        pos_block.set_consensus_tag(ConsensusTag::Pos);
        // 3000 of 12000 total stake: a quarter of the base reward
        assert_eq!(
            engine.block_reward(&pos_block, &registry),
            BASE_BLOCK_REWARD / 4
        );
    }
}
