//! Height-based algorithm dispatch.
//!
//! Even heights hash with Ethash against the epoch context for the height.
//! Odd heights hash the header with the light-VM backend, seeded by the hash
//! of the block at [`seed_height`]. Both return a digest in big-endian
//! comparison order, ready for [`less_equal`] against a target.

use std::fmt;

use tracing::trace;

use super::difficulty::less_equal;
use super::seed::seed_height;
use super::{SeedHash, U256};
use crate::config::PowConfig;
use crate::error::PowResult;
use crate::ethash::{self, EpochContextCache, Hash512Fn, Keccak512Fn};
use crate::randomx::{RxBackend, RxCacheManager, SoftBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowAlgorithm {
    Ethash,
    RandomX,
}

impl PowAlgorithm {
    pub fn for_height(height: u64) -> Self {
        if height % 2 == 0 {
            PowAlgorithm::Ethash
        } else {
            PowAlgorithm::RandomX
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowAlgorithm::Ethash => "ethash",
            PowAlgorithm::RandomX => "randomx",
        }
    }
}

impl fmt::Display for PowAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns both engines. Construct once and share by reference.
pub struct PowHasher<B: RxBackend = SoftBackend, H: Hash512Fn = Keccak512Fn> {
    epochs: EpochContextCache<H>,
    randomx: RxCacheManager<B>,
}

impl PowHasher<SoftBackend, Keccak512Fn> {
    /// Ethash with Keccak-512 plus the soft light-VM backend.
    pub fn from_config(cfg: &PowConfig) -> PowResult<Self> {
        Self::with_backend(cfg, SoftBackend::new(cfg.randomx.soft))
    }
}

impl<B: RxBackend> PowHasher<B, Keccak512Fn> {
    pub fn with_backend(cfg: &PowConfig, backend: B) -> PowResult<Self> {
        cfg.validate()?;
        let epochs = EpochContextCache::new(
            cfg.ethash.sizing,
            cfg.ethash.full_dataset,
            cfg.ethash.retained_epochs,
        )
        .with_l1_cache(cfg.ethash.l1_cache);
        epochs.set_memory_limit(cfg.ethash.memory_limit_bytes());
        Ok(Self::new(epochs, RxCacheManager::new(backend, cfg.randomx.max_idle_vms)))
    }
}

impl<B: RxBackend, H: Hash512Fn> PowHasher<B, H> {
    pub fn new(epochs: EpochContextCache<H>, randomx: RxCacheManager<B>) -> Self {
        Self { epochs, randomx }
    }

    pub fn epochs(&self) -> &EpochContextCache<H> {
        &self.epochs
    }

    pub fn randomx(&self) -> &RxCacheManager<B> {
        &self.randomx
    }

    /// New best seed for the odd-height algorithm.
    pub fn set_main_seed(&self, seed: &SeedHash) -> PowResult<()> {
        self.randomx.set_main_seed(seed)
    }

    /// PoW digest for a header at `height`.
    ///
    /// `block_hash_at` is called once, with the seed height, and only for odd
    /// heights. `nonce` only affects even heights.
    pub fn pow_hash<F>(
        &self,
        height: u64,
        header_hash: &U256,
        nonce: u64,
        block_hash_at: F,
    ) -> PowResult<U256>
    where
        F: FnOnce(u64) -> SeedHash,
    {
        let algorithm = PowAlgorithm::for_height(height);
        trace!(target: "hybrid_pow::pow", height, %algorithm, "pow hash");
        match algorithm {
            PowAlgorithm::Ethash => {
                let ctx = self.epochs.get_for_height(height)?;
                Ok(ethash::mix(&ctx, height, header_hash, nonce)?.final_hash)
            }
            PowAlgorithm::RandomX => {
                let seed = block_hash_at(seed_height(height));
                let mut out = self.randomx.hash(&seed, header_hash)?;
                // Light-VM output is a little-endian number.
                out.reverse();
                Ok(out)
            }
        }
    }

    /// `pow_hash(..) <= target`.
    pub fn check_pow<F>(
        &self,
        height: u64,
        header_hash: &U256,
        nonce: u64,
        target: &U256,
        block_hash_at: F,
    ) -> PowResult<bool>
    where
        F: FnOnce(u64) -> SeedHash,
    {
        let digest = self.pow_hash(height, header_hash, nonce, block_hash_at)?;
        Ok(less_equal(&digest, target))
    }
}
