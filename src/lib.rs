//! Proof-of-work hashing for a chain that alternates algorithms by height.
//!
//! Even heights use Ethash, odd heights use a cache-based light-VM hash
//! (RandomX or its pure-Rust stand-in). [`PowHasher`] owns the state both
//! need: epoch contexts for Ethash and two seed generations for the light
//! VMs.
//!
//! ```no_run
//! use hybrid_pow::{less_equal, PowConfig, PowHasher, SeedHash};
//!
//! # fn main() -> Result<(), hybrid_pow::PowError> {
//! let hasher = PowHasher::from_config(&PowConfig::default())?;
//! let header = [0u8; 32];
//! let digest = hasher.pow_hash(1_000_001, &header, 0, |_seed_height| SeedHash::ZERO)?;
//! let accepted = less_equal(&digest, &[0xff; 32]);
//! # let _ = accepted;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ethash;
pub mod metrics;
pub mod pow;
pub mod randomx;

pub use config::{PowConfig, RxBackendKind};
pub use error::{PowError, PowResult};
pub use pow::{
    check_against_difficulty, epoch_number, equal, less_equal, seed_height, target_from_difficulty,
    PowAlgorithm, PowHasher, SeedHash, U256,
};
