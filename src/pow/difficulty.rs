//! Big-endian 256-bit comparisons used for difficulty checks.
//!
//! A PoW digest is valid when it compares less than or equal to the target,
//! both read as big-endian integers. The inputs are public once a block is
//! broadcast, so these are not hardened against timing.

use super::U256;

#[inline]
fn word(h: &U256, i: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&h[i * 8..i * 8 + 8]);
    u64::from_be_bytes(w)
}

/// `a <= b` as big-endian 256-bit integers, compared one 64-bit word at a
/// time from the most significant end.
#[inline]
pub fn less_equal(a: &U256, b: &U256) -> bool {
    for i in 0..4 {
        let (x, y) = (word(a, i), word(b, i));
        if x > y {
            return false;
        }
        if x < y {
            return true;
        }
    }
    true
}

/// Exact 256-bit equality. Every word is compared regardless of earlier
/// mismatches.
#[inline]
pub fn equal(a: &U256, b: &U256) -> bool {
    (word(a, 0) == word(b, 0))
        & (word(a, 1) == word(b, 1))
        & (word(a, 2) == word(b, 2))
        & (word(a, 3) == word(b, 3))
}

/// Little-endian 64-bit limbs of a big-endian 256-bit value.
#[inline]
fn limbs(h: &U256) -> [u64; 4] {
    [word(h, 3), word(h, 2), word(h, 1), word(h, 0)]
}

/// Ethash-style difficulty check: passes iff `final_hash * difficulty`
/// fits in 256 bits, i.e. `final_hash <= (2^256 - 1) / difficulty`.
///
/// A zero difficulty accepts every hash.
pub fn check_against_difficulty(final_hash: &U256, difficulty: &U256) -> bool {
    let h = limbs(final_hash);
    let d = limbs(difficulty);
    let mut p = [0u64; 8];

    for i in 0..4 {
        let mut carry: u128 = 0;
        for j in 0..4 {
            let t = (h[i] as u128) * (d[j] as u128) + p[i + j] as u128 + carry;
            p[i + j] = t as u64;
            carry = t >> 64;
        }
        p[i + 4] = carry as u64;
    }

    p[4..].iter().all(|&w| w == 0)
}

/// Widen a scalar difficulty to a big-endian 256-bit value.
pub fn u256_from_u64(v: u64) -> U256 {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&v.to_be_bytes());
    out
}

/// Target for a scalar difficulty: `floor((2^256 - 1) / difficulty)`.
/// Higher difficulty = lower target (harder to mine). Zero maps to the
/// easiest target.
pub fn target_from_difficulty(difficulty: u64) -> U256 {
    if difficulty == 0 {
        return [0xFF; 32];
    }

    let d = difficulty as u128;
    let mut rem: u128 = 0;
    let mut out = [0u8; 32];
    for i in 0..4 {
        let cur = (rem << 64) | u64::MAX as u128;
        out[i * 8..i * 8 + 8].copy_from_slice(&((cur / d) as u64).to_be_bytes());
        rem = cur % d;
    }
    out
}
