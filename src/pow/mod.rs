//! Shared PoW types and the height-based dispatcher.
//!
//! Hashes and targets are plain 32-byte arrays in big-endian comparison
//! order (byte 0 is the most significant). Seeds get their own type because
//! their identity decides which cache generation a hash runs against.

pub mod difficulty;
pub mod dispatch;
pub mod seed;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PowError, PowResult};

pub use difficulty::{check_against_difficulty, equal, less_equal, target_from_difficulty};
pub use dispatch::{PowAlgorithm, PowHasher};
pub use seed::{epoch_number, seed_height, SeedChain};

pub type U256 = [u8; 32];

/// Size of a seed hash in bytes.
pub const SEED_SIZE: usize = 32;

/// 32-byte value identifying an epoch or a cache generation.
///
/// Two seeds are equal iff all 32 bytes match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SeedHash([u8; SEED_SIZE]);

impl SeedHash {
    pub const ZERO: SeedHash = SeedHash([0u8; SEED_SIZE]);

    pub const fn new(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> PowResult<Self> {
        let arr: [u8; SEED_SIZE] = bytes
            .try_into()
            .map_err(|_| PowError::InvalidSeed { len: bytes.len() })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> PowResult<Self> {
        let bytes = decode_hex("seed", s)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; SEED_SIZE]> for SeedHash {
    fn from(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for SeedHash {
    type Error = PowError;

    fn try_from(bytes: &[u8]) -> PowResult<Self> {
        Self::from_slice(bytes)
    }
}

impl AsRef<[u8]> for SeedHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SeedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SeedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeedHash({})", self.to_hex())
    }
}

impl Serialize for SeedHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SeedHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SeedHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Decode hex with an optional `0x` prefix.
pub fn decode_hex(label: &'static str, s: &str) -> PowResult<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| PowError::InvalidHex {
        label,
        reason: e.to_string(),
    })
}

/// Strict 32-byte hex decode for header hashes and targets.
pub fn hex32_strict(label: &'static str, s: &str) -> PowResult<U256> {
    let bytes = decode_hex(label, s)?;
    bytes.as_slice().try_into().map_err(|_| PowError::InvalidHex {
        label,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}
