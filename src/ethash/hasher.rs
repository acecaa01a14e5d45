//! 512/1024/2048-bit digest types and the base hash used to build light caches.

use sha3::{Digest, Keccak512};

/// 512-bit digest held as sixteen little-endian 32-bit words.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash512(pub [u32; 16]);

/// Dataset item: two consecutive 512-bit sub-items.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash1024(pub [Hash512; 2]);

/// Wide dataset item: four consecutive 512-bit sub-items, the same bytes
/// as two adjacent [`Hash1024`] items.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash2048(pub [Hash512; 4]);

impl Hash512 {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut words = [0u32; 16];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Hash512(words)
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        for (chunk, w) in out.chunks_exact_mut(4).zip(self.0.iter()) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    #[inline]
    pub fn word(&self, i: usize) -> u32 {
        self.0[i]
    }

    #[inline]
    pub fn xor(&self, other: &Hash512) -> Hash512 {
        let mut out = *self;
        for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
            *a ^= *b;
        }
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl std::fmt::Debug for Hash512 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash512({})", self.to_hex())
    }
}

impl Hash1024 {
    /// All 32 words, first sub-item first.
    pub fn words(&self) -> [u32; 32] {
        let mut out = [0u32; 32];
        out[..16].copy_from_slice(&self.0[0].0);
        out[16..].copy_from_slice(&self.0[1].0);
        out
    }

    pub fn to_hex(&self) -> String {
        format!("{}{}", self.0[0].to_hex(), self.0[1].to_hex())
    }
}

impl std::fmt::Debug for Hash1024 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash1024({})", self.to_hex())
    }
}

impl Hash2048 {
    pub fn from_pair(lo: &Hash1024, hi: &Hash1024) -> Self {
        Hash2048([lo.0[0], lo.0[1], hi.0[0], hi.0[1]])
    }

    pub fn words(&self) -> [u32; 64] {
        let mut out = [0u32; 64];
        for (chunk, h) in out.chunks_exact_mut(16).zip(self.0.iter()) {
            chunk.copy_from_slice(&h.0);
        }
        out
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(Hash512::to_hex).collect()
    }
}

impl std::fmt::Debug for Hash2048 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash2048({})", self.to_hex())
    }
}

/// Base hash for light cache construction.
///
/// Implementations must be deterministic; the light cache of an epoch is a
/// pure function of this hash and the epoch seed.
pub trait Hash512Fn: Send + Sync {
    fn hash512(&self, data: &[u8]) -> Hash512;
}

/// Keccak-512 with pre-FIPS padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Keccak512Fn;

impl Hash512Fn for Keccak512Fn {
    #[inline]
    fn hash512(&self, data: &[u8]) -> Hash512 {
        keccak512(data)
    }
}

impl<F> Hash512Fn for F
where
    F: Fn(&[u8]) -> Hash512 + Send + Sync,
{
    fn hash512(&self, data: &[u8]) -> Hash512 {
        self(data)
    }
}

#[inline]
pub fn keccak512(data: &[u8]) -> Hash512 {
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&Keccak512::digest(data));
    Hash512::from_bytes(&bytes)
}
