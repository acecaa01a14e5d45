//! Height -> epoch and height -> seed-height arithmetic.
//!
//! The dataset algorithm (even heights) rotates its light cache every
//! [`EPOCH_LENGTH`] blocks. The cache algorithm (odd heights) takes its seed
//! from the hash of a block at [`seed_height`], which lags the tip by
//! [`SEEDHASH_EPOCH_LAG`] blocks so the seed is always buried under
//! confirmations.

use parking_lot::Mutex;
use sha3::{Digest, Keccak256};

use super::SeedHash;

/// Blocks per Ethash epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

/// Blocks per RandomX seed epoch. Must be a power of two.
pub const SEEDHASH_EPOCH_BLOCKS: u64 = 2048;

/// Confirmations a seed block must have before it is used.
pub const SEEDHASH_EPOCH_LAG: u64 = 64;

#[inline]
pub fn epoch_number(height: u64) -> u64 {
    height / EPOCH_LENGTH
}

/// Height of the block whose hash seeds the RandomX cache for `height`.
///
/// Returns 0 up to and including `SEEDHASH_EPOCH_BLOCKS + SEEDHASH_EPOCH_LAG`,
/// then `height - LAG - 1` rounded down to a multiple of `SEEDHASH_EPOCH_BLOCKS`.
#[inline]
pub fn seed_height(height: u64) -> u64 {
    if height <= SEEDHASH_EPOCH_BLOCKS + SEEDHASH_EPOCH_LAG {
        0
    } else {
        (height - SEEDHASH_EPOCH_LAG - 1) & !(SEEDHASH_EPOCH_BLOCKS - 1)
    }
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// Highest epoch whose seed [`SeedChain`] keeps. Seeds past it are hashed
/// forward from this one on every request and never stored.
pub const MAX_MEMOIZED_EPOCH: u64 = 32_768;

#[inline]
fn next_seed(seed: &SeedHash) -> SeedHash {
    SeedHash::new(keccak256(seed.as_bytes()))
}

/// Canonical Ethash epoch seeds, computed incrementally and kept.
///
/// `seed(0)` is all zeroes, `seed(e) = keccak256(seed(e - 1))`. Asking for
/// epoch `e` extends the chain from the last known seed, so every seed up to
/// [`MAX_MEMOIZED_EPOCH`] is hashed once per process. Hashing happens with
/// the lock released.
pub struct SeedChain {
    seeds: Mutex<Vec<SeedHash>>,
}

impl Default for SeedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedChain {
    pub fn new() -> Self {
        Self {
            seeds: Mutex::new(vec![SeedHash::ZERO]),
        }
    }

    pub fn seed(&self, epoch: u64) -> SeedHash {
        let memo = epoch.min(MAX_MEMOIZED_EPOCH) as usize;
        let (mut at, mut seed) = {
            let seeds = self.seeds.lock();
            let at = memo.min(seeds.len() - 1);
            (at, seeds[at])
        };

        if at < memo {
            let start = at + 1;
            let mut fresh = Vec::with_capacity(memo - at);
            while at < memo {
                seed = next_seed(&seed);
                fresh.push(seed);
                at += 1;
            }
            // Another caller may have extended the chain meanwhile.
            let mut seeds = self.seeds.lock();
            if seeds.len() <= memo {
                let skip = seeds.len() - start;
                seeds.extend_from_slice(&fresh[skip..]);
            }
        }

        for _ in memo as u64..epoch {
            seed = next_seed(&seed);
        }
        seed
    }

    /// Number of seeds materialized so far.
    pub fn len(&self) -> usize {
        self.seeds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Reverse lookup: the epoch whose seed is `seed`, searching up to and
    /// including `max_epoch`.
    pub fn find_epoch(&self, seed: &SeedHash, max_epoch: u64) -> Option<u64> {
        if let Some(pos) = self.seeds.lock().iter().position(|s| s == seed) {
            return (pos as u64 <= max_epoch).then_some(pos as u64);
        }
        let known = self.len() as u64;
        let memo = max_epoch.min(MAX_MEMOIZED_EPOCH);
        if let Some(e) = (known..=memo).find(|&e| self.seed(e) == *seed) {
            return Some(e);
        }
        let mut cur = self.seed(memo);
        ((memo + 1)..=max_epoch).find(|_| {
            cur = next_seed(&cur);
            cur == *seed
        })
    }
}

/// One-shot seed computation without memoization.
pub fn epoch_seed(epoch: u64) -> SeedHash {
    let mut s = [0u8; 32];
    for _ in 0..epoch {
        s = keccak256(&s);
    }
    SeedHash::new(s)
}
