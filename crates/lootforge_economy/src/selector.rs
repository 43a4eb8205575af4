//! # Weighted Selector
//!
//! Maps a random draw onto exactly one reward of a table.
//!
//! ## Algorithm
//!
//! ```text
//! weights:   [ 30 |     50      |  20  ]
//! ranges:    [0,30) [30,80)      [80,100)
//! draw r = word mod total_weight, the range containing r wins
//! ```
//!
//! Linear in the number of rewards and deterministic for a given draw.
//! Tables are append-only, so an index picked once stays valid forever.

use alloy_primitives::U256;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;

use crate::asset::{BoxId, Reward};
use crate::error::{LootBoxError, LootBoxResult};

/// Sum of all reward weights of a table.
#[inline]
#[must_use]
pub fn total_weight(rewards: &[Reward]) -> u64 {
    rewards.iter().map(|r| u64::from(r.weight)).sum()
}

/// Returns the index whose cumulative-weight range contains `draw`.
///
/// `draw` must lie in `[0, total_weight)`; anything past the end yields `None`.
#[must_use]
pub fn select_index(rewards: &[Reward], draw: u64) -> Option<usize> {
    let mut cumulative = 0u64;

    for (index, reward) in rewards.iter().enumerate() {
        cumulative += u64::from(reward.weight);
        if draw < cumulative {
            return Some(index);
        }
    }

    None
}

/// Reduces a 256-bit random word into `[0, total)`.
///
/// `total` must be non-zero.
#[inline]
#[must_use]
pub fn reduce(word: U256, total: u64) -> u64 {
    let reduced = word % U256::from(total);
    // reduced < total <= u64::MAX, so it lives entirely in the low limb
    reduced.as_limbs()[0]
}

/// Picks a reward index for `box_id` from a random word.
///
/// # Errors
///
/// Returns [`LootBoxError::NoRewardsAvailable`] if the table is empty or
/// its total weight is zero.
pub fn pick(box_id: BoxId, rewards: &[Reward], word: U256) -> LootBoxResult<usize> {
    let total = total_weight(rewards);
    if total == 0 {
        return Err(LootBoxError::NoRewardsAvailable(box_id));
    }

    let draw = reduce(word, total);
    select_index(rewards, draw).ok_or(LootBoxError::NoRewardsAvailable(box_id))
}

/// Histogram of simulated draws over one table.
#[derive(Clone, Debug, Default)]
pub struct SelectionStatistics {
    /// Total number of draws performed.
    pub total_draws: u64,
    /// Hits per reward index.
    pub hits: HashMap<usize, u64>,
}

impl SelectionStatistics {
    /// Observed share of `index` in percent.
    #[must_use]
    pub fn share_percent(&self, index: usize) -> f64 {
        if self.total_draws == 0 {
            return 0.0;
        }
        let hits = self.hits.get(&index).copied().unwrap_or(0);
        (hits as f64 / self.total_draws as f64) * 100.0
    }
}

/// Draws `iterations` times from a ChaCha20 stream seeded with `seed`.
///
/// Used by benches and tests to check the observed distribution against
/// the configured weights.
#[must_use]
pub fn run_statistics(rewards: &[Reward], iterations: u32, seed: u64) -> SelectionStatistics {
    let mut stats = SelectionStatistics::default();
    let total = total_weight(rewards);
    if total == 0 {
        return stats;
    }

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut bytes = [0u8; 32];
    for _ in 0..iterations {
        rng.fill_bytes(&mut bytes);
        let word = U256::from_be_slice(&bytes);
        if let Some(index) = select_index(rewards, reduce(word, total)) {
            stats.total_draws += 1;
            *stats.hits.entry(index).or_insert(0) += 1;
        }
    }

    stats
}
