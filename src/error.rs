//! Error types for PoW hashing.

use thiserror::Error;

/// Errors raised by the epoch context engine, the RandomX cache manager and
/// the height dispatcher.
///
/// Nothing in this crate retries on its own; callers decide whether an
/// allocation failure is worth another attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    /// Memory for a cache, dataset or VM could not be reserved.
    #[error("allocation failed for {what} ({bytes} bytes)")]
    Allocation { what: &'static str, bytes: u64 },

    /// A generation expected to be ready was found unset. This is a logic
    /// defect, not a runtime condition.
    #[error("uninitialized state: {0}")]
    UninitializedState(&'static str),

    /// A seed buffer was not exactly 32 bytes.
    #[error("invalid seed: expected 32 bytes, got {len}")]
    InvalidSeed { len: usize },

    /// The height handed to the mixing function belongs to another epoch.
    #[error("height {height} is outside epoch {epoch}")]
    EpochMismatch { height: u64, epoch: u64 },

    #[error("{label}: invalid hex: {reason}")]
    InvalidHex { label: &'static str, reason: String },

    /// Failure reported by a light-VM backend.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("config error: {0}")]
    Config(String),
}

impl PowError {
    pub fn allocation(what: &'static str, bytes: u64) -> Self {
        PowError::Allocation { what, bytes }
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self, PowError::Allocation { .. })
    }
}

pub type PowResult<T> = Result<T, PowError>;
