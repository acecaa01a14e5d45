//! Ethash: the dataset-based algorithm used on even heights.
//!
//! An [`EpochContext`] holds the light cache for one epoch and, when full
//! mode is requested, the whole dataset. Verification only touches 64
//! dataset items per hash, so light mode computes those items on demand.
//! [`EpochContextCache`] owns contexts across epochs.

pub mod cache;
pub mod context;
pub mod hasher;
pub mod hashimoto;
pub mod sizing;

pub use cache::{EpochContextCache, EpochStatsSnapshot};
pub use context::{
    build_light_cache, calculate_dataset_item_1024, calculate_dataset_item_2048, create_epoch_context,
    ContextOptions, EpochContext, FullDataset, L1Cache, LightCache,
};
pub use hasher::{keccak512, Hash1024, Hash2048, Hash512, Hash512Fn, Keccak512Fn};
pub use hashimoto::{hash, mix, verify, MixResult, VerificationResult};
pub use sizing::{find_largest_prime, EpochParams};

use crate::pow::seed::{SeedChain, MAX_MEMOIZED_EPOCH};
use crate::pow::SeedHash;

pub const LIGHT_CACHE_ITEM_SIZE: u64 = 64;
pub const FULL_DATASET_ITEM_SIZE: u64 = 128;
/// Bytes of the dataset prefix mirrored into the L1 cache.
pub const L1_CACHE_SIZE: u64 = 16 * 1024;
pub const L1_CACHE_NUM_ITEMS: u32 = (L1_CACHE_SIZE / 256) as u32;
pub const LIGHT_CACHE_ROUNDS: usize = 3;
pub const DATASET_PARENTS: u32 = 256;
pub const DATASET_ACCESSES: u32 = 64;
pub const FNV_PRIME: u32 = 0x0100_0193;

/// Highest epoch [`find_epoch_number`] searches.
pub const MAX_EPOCH_SEARCH: u64 = MAX_MEMOIZED_EPOCH;

/// Epoch whose canonical seed is `seed`, if any within [`MAX_EPOCH_SEARCH`].
pub fn find_epoch_number(chain: &SeedChain, seed: &SeedHash) -> Option<u64> {
    chain.find_epoch(seed, MAX_EPOCH_SEARCH)
}
