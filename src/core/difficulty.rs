use crate::core::Block;
use crate::error::{NodeError, Result};
use log::info;

// Difficulty bounds in leading zero nibbles
const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 10;

/// Difficulty adjustment for steering toward the target block interval
///
/// Every `window` blocks the measured span is compared against the target
/// span and the difficulty stepped within clamped bounds. One nibble step is
/// a sixteenfold change in expected work, so the small steps here are large
/// multiplicative corrections. The result is deterministic from on-chain
/// timestamps only.
pub struct DifficultyAdjustment;

impl DifficultyAdjustment {
    /// Calculate the difficulty for the block at `next_height` given the
    /// most recent `window` blocks (oldest first).
    pub fn calculate_next_difficulty(
        recent_blocks: &[Block],
        next_height: u64,
        window: u64,
        target_interval_ms: u64,
    ) -> Result<u32> {
        let current_difficulty = recent_blocks
            .last()
            .map(|block| block.get_difficulty())
            .ok_or_else(|| {
                NodeError::Internal("difficulty adjustment needs at least one block".to_string())
            })?;

        // Only adjust at window boundaries
        if next_height % window != 0 || next_height < window {
            return Ok(current_difficulty);
        }

        if (recent_blocks.len() as u64) != window {
            return Err(NodeError::Internal(format!(
                "need {window} blocks for difficulty adjustment, got {}",
                recent_blocks.len()
            )));
        }

        let actual_span = Self::measured_span(recent_blocks)?;
        let target_span = target_interval_ms * window;

        let new_difficulty =
            Self::adjust_difficulty(current_difficulty, actual_span, target_span);

        info!(
            "Difficulty adjustment at height {next_height}: {current_difficulty} -> {new_difficulty} (actual: {actual_span}ms, target: {target_span}ms)"
        );

        Ok(new_difficulty)
    }

    /// Milliseconds between the first and last block of the window
    fn measured_span(blocks: &[Block]) -> Result<u64> {
        let first_timestamp = blocks
            .first()
            .map(Block::get_timestamp)
            .ok_or_else(|| NodeError::Internal("empty difficulty window".to_string()))?;
        let last_timestamp = blocks
            .last()
            .map(Block::get_timestamp)
            .ok_or_else(|| NodeError::Internal("empty difficulty window".to_string()))?;

        // Clock skew between proposers can produce a non-increasing span;
        // treat it as the fastest-possible window rather than failing
        Ok(last_timestamp.saturating_sub(first_timestamp).max(1) as u64)
    }

    /// Step the difficulty based on how far the window drifted from target
    fn adjust_difficulty(current_difficulty: u32, actual_ms: u64, target_ms: u64) -> u32 {
        let time_ratio = actual_ms as f64 / target_ms as f64;

        let new_difficulty = if time_ratio < 0.5 {
            // Blocks far too fast
            current_difficulty + 2
        } else if time_ratio < 0.75 {
            // Blocks a bit too fast
            current_difficulty + 1
        } else if time_ratio > 2.0 {
            // Blocks far too slow
            current_difficulty.saturating_sub(2)
        } else if time_ratio > 1.5 {
            // Blocks a bit too slow
            current_difficulty.saturating_sub(1)
        } else {
            current_difficulty
        };

        new_difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
    }

    /// Validate that a difficulty value is within acceptable bounds
    pub fn validate_difficulty(difficulty: u32) -> Result<()> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
            return Err(NodeError::Validation(format!(
                "Difficulty {difficulty} is outside valid range [{MIN_DIFFICULTY}, {MAX_DIFFICULTY}]"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;

    const WINDOW: u64 = 10;
    const TARGET_MS: u64 = 30_000;

    fn create_test_block(index: u64, timestamp: i64, difficulty: u32) -> Block {
        let dummy_tx = TransactionBuilder::standard("alice", "bob", 1, 0)
            .expect("Failed to create test transaction");

        Block::new_test_block(
            timestamp,
            "test_prev_hash".to_string(),
            &[dummy_tx],
            index,
            difficulty,
        )
        .expect("Failed to create test block")
    }

    fn window_with_spacing(spacing_ms: i64, difficulty: u32) -> Vec<Block> {
        (0..WINDOW)
            .map(|i| create_test_block(i, i as i64 * spacing_ms, difficulty))
            .collect()
    }

    #[test]
    fn test_no_adjustment_off_boundary() {
        let blocks = window_with_spacing(1_000, 4);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&blocks, 15, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, 4);
    }

    #[test]
    fn test_fast_blocks_raise_difficulty() {
        // 9 intervals of 1s against a 300s target: far too fast
        let blocks = window_with_spacing(1_000, 4);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&blocks, WINDOW, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, 6);
    }

    #[test]
    fn test_slow_blocks_lower_difficulty() {
        // 9 intervals of 80s against a 300s target: far too slow
        let blocks = window_with_spacing(80_000, 4);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&blocks, WINDOW, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn test_on_target_keeps_difficulty() {
        // 9 intervals of 33.3s: within the dead band
        let blocks = window_with_spacing(33_300, 4);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&blocks, WINDOW, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, 4);
    }

    #[test]
    fn test_difficulty_never_leaves_bounds() {
        let slow = window_with_spacing(500_000, MIN_DIFFICULTY);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&slow, WINDOW, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, MIN_DIFFICULTY);

        let fast = window_with_spacing(10, MAX_DIFFICULTY);
        let result =
            DifficultyAdjustment::calculate_next_difficulty(&fast, WINDOW, WINDOW, TARGET_MS)
                .unwrap();
        assert_eq!(result, MAX_DIFFICULTY);
    }

    #[test]
    fn test_validate_difficulty_bounds() {
        assert!(DifficultyAdjustment::validate_difficulty(0).is_err());
        assert!(DifficultyAdjustment::validate_difficulty(1).is_ok());
        assert!(DifficultyAdjustment::validate_difficulty(10).is_ok());
        assert!(DifficultyAdjustment::validate_difficulty(11).is_err());
    }
}
