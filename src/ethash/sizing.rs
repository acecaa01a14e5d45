//! Per-epoch light cache and dataset sizing.

use serde::{Deserialize, Serialize};

use super::{FULL_DATASET_ITEM_SIZE, LIGHT_CACHE_ITEM_SIZE};
use crate::pow::seed::EPOCH_LENGTH;

/// Epoch sizing parameters.
///
/// Mainnet sizing is the default. Devnets and tests use [`EpochParams::devnet`]
/// so a context builds in microseconds instead of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochParams {
    pub epoch_length: u64,
    pub light_cache_init_bytes: u64,
    pub light_cache_growth_bytes: u64,
    pub full_dataset_init_bytes: u64,
    pub full_dataset_growth_bytes: u64,
}

impl Default for EpochParams {
    fn default() -> Self {
        Self::MAINNET
    }
}

impl EpochParams {
    pub const MAINNET: EpochParams = EpochParams {
        epoch_length: EPOCH_LENGTH,
        light_cache_init_bytes: 1 << 24,
        light_cache_growth_bytes: 1 << 17,
        full_dataset_init_bytes: 1 << 30,
        full_dataset_growth_bytes: 1 << 23,
    };

    /// Tiny sizing: 4 KiB light cache and 64 KiB dataset at epoch 0.
    pub const fn devnet() -> Self {
        EpochParams {
            epoch_length: EPOCH_LENGTH,
            light_cache_init_bytes: 1 << 12,
            light_cache_growth_bytes: 1 << 10,
            full_dataset_init_bytes: 1 << 16,
            full_dataset_growth_bytes: 1 << 12,
        }
    }

    #[inline]
    pub fn epoch_number(&self, height: u64) -> u64 {
        height / self.epoch_length
    }

    pub fn light_cache_num_items(&self, epoch: u64) -> u32 {
        num_items(
            self.light_cache_init_bytes,
            self.light_cache_growth_bytes,
            LIGHT_CACHE_ITEM_SIZE,
            epoch,
        )
    }

    pub fn full_dataset_num_items(&self, epoch: u64) -> u32 {
        num_items(
            self.full_dataset_init_bytes,
            self.full_dataset_growth_bytes,
            FULL_DATASET_ITEM_SIZE,
            epoch,
        )
    }

    pub fn light_cache_size(&self, epoch: u64) -> u64 {
        self.light_cache_num_items(epoch) as u64 * LIGHT_CACHE_ITEM_SIZE
    }

    pub fn full_dataset_size(&self, epoch: u64) -> u64 {
        self.full_dataset_num_items(epoch) as u64 * FULL_DATASET_ITEM_SIZE
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.epoch_length == 0 {
            return Err("epoch_length must be > 0".into());
        }
        if self.light_cache_init_bytes < LIGHT_CACHE_ITEM_SIZE * 2 {
            return Err(format!(
                "light_cache_init_bytes must hold at least two items ({} bytes)",
                LIGHT_CACHE_ITEM_SIZE * 2
            ));
        }
        if self.full_dataset_init_bytes < FULL_DATASET_ITEM_SIZE * 2 {
            return Err(format!(
                "full_dataset_init_bytes must hold at least two items ({} bytes)",
                FULL_DATASET_ITEM_SIZE * 2
            ));
        }
        Ok(())
    }
}

fn num_items(init: u64, growth: u64, item_size: u64, epoch: u64) -> u32 {
    let upper = (init / item_size)
        .saturating_add(epoch.saturating_mul(growth / item_size))
        .min(u32::MAX as u64) as u32;
    find_largest_prime(upper)
}

fn is_odd_prime(n: u32) -> bool {
    let n = n as u64;
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Largest prime `<= upper`, or 0 when there is none.
pub fn find_largest_prime(upper: u32) -> u32 {
    if upper < 2 {
        return 0;
    }
    if upper == 2 {
        return 2;
    }
    let mut n = if upper % 2 == 0 { upper - 1 } else { upper };
    while !is_odd_prime(n) {
        n -= 2;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_largest_prime() {
        assert_eq!(find_largest_prime(0), 0);
        assert_eq!(find_largest_prime(1), 0);
        assert_eq!(find_largest_prime(2), 2);
        assert_eq!(find_largest_prime(3), 3);
        assert_eq!(find_largest_prime(4), 3);
        assert_eq!(find_largest_prime(100), 97);
        assert_eq!(find_largest_prime(7919), 7919);
        assert_eq!(find_largest_prime(7920), 7919);
    }

    #[test]
    fn test_mainnet_sizes() {
        let p = EpochParams::MAINNET;
        assert_eq!(p.light_cache_num_items(0), 262_139);
        assert_eq!(p.full_dataset_num_items(0), 8_388_593);
        assert_eq!(p.light_cache_num_items(33), 329_723);
        assert_eq!(p.full_dataset_num_items(33), 10_551_263);
        assert_eq!(p.light_cache_size(0), 262_139 * 64);
        assert_eq!(p.full_dataset_size(0), 8_388_593 * 128);
    }

    #[test]
    fn test_devnet_sizes() {
        let p = EpochParams::devnet();
        assert_eq!(p.light_cache_num_items(0), 61);
        assert_eq!(p.full_dataset_num_items(0), 509);
        assert_eq!(p.light_cache_num_items(3), 109);
        assert_eq!(p.full_dataset_num_items(3), 607);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_sizing() {
        let mut p = EpochParams::devnet();
        p.epoch_length = 0;
        assert!(p.validate().is_err());

        let mut p = EpochParams::devnet();
        p.light_cache_init_bytes = 64;
        assert!(p.validate().is_err());
    }
}
