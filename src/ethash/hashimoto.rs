//! Hashimoto: the memory-hard mix over dataset items.

use serde::Serialize;

use super::context::{fnv1, EpochContext};
use super::hasher::{keccak512, Hash512};
use super::DATASET_ACCESSES;
use crate::error::{PowError, PowResult};
use crate::pow::difficulty::{equal, less_equal};
use crate::pow::seed::keccak256;
use crate::pow::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixResult {
    pub final_hash: U256,
    pub mix_hash: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationResult {
    Ok,
    InvalidFinalHash,
    InvalidMixHash,
}

fn hash_seed(header_hash: &U256, nonce: u64) -> Hash512 {
    let mut buf = [0u8; 40];
    buf[..32].copy_from_slice(header_hash);
    buf[32..].copy_from_slice(&nonce.to_le_bytes());
    keccak512(&buf)
}

fn hash_final(seed: &Hash512, mix_hash: &U256) -> U256 {
    let mut buf = [0u8; 96];
    buf[..64].copy_from_slice(&seed.to_bytes());
    buf[64..].copy_from_slice(mix_hash);
    keccak256(&buf)
}

fn hash_kernel(ctx: &EpochContext, seed: &Hash512) -> U256 {
    let num_items = ctx.dataset_num_items();
    let seed_init = seed.word(0);

    let mut mix = [0u32; 32];
    mix[..16].copy_from_slice(&seed.0);
    mix[16..].copy_from_slice(&seed.0);

    for i in 0..DATASET_ACCESSES {
        let p = fnv1(i ^ seed_init, mix[(i % 32) as usize]) % num_items;
        let item = ctx.item(p).words();
        for (m, d) in mix.iter_mut().zip(item.iter()) {
            *m = fnv1(*m, *d);
        }
    }

    let mut mix_hash = [0u8; 32];
    for (out, w) in mix_hash.chunks_exact_mut(4).zip(mix.chunks_exact(4)) {
        let h = fnv1(fnv1(fnv1(w[0], w[1]), w[2]), w[3]);
        out.copy_from_slice(&h.to_le_bytes());
    }
    mix_hash
}

/// Hash without checking that the context matches any height.
pub fn hash(ctx: &EpochContext, header_hash: &U256, nonce: u64) -> MixResult {
    let seed = hash_seed(header_hash, nonce);
    let mix_hash = hash_kernel(ctx, &seed);
    MixResult {
        final_hash: hash_final(&seed, &mix_hash),
        mix_hash,
    }
}

fn check_epoch(ctx: &EpochContext, height: u64) -> PowResult<()> {
    if height / ctx.epoch_length() != ctx.epoch() {
        return Err(PowError::EpochMismatch {
            height,
            epoch: ctx.epoch(),
        });
    }
    Ok(())
}

/// Mix `header_hash` and `nonce` against the dataset of the epoch `height`
/// belongs to. Fails if `ctx` is for a different epoch.
pub fn mix(ctx: &EpochContext, height: u64, header_hash: &U256, nonce: u64) -> PowResult<MixResult> {
    check_epoch(ctx, height)?;
    Ok(hash(ctx, header_hash, nonce))
}

/// Light verification of a claimed `(mix_hash, nonce)` pair.
///
/// The final hash is checked against `boundary` first; the dataset pass only
/// runs when that succeeds.
pub fn verify(
    ctx: &EpochContext,
    height: u64,
    header_hash: &U256,
    mix_hash: &U256,
    nonce: u64,
    boundary: &U256,
) -> PowResult<VerificationResult> {
    check_epoch(ctx, height)?;
    let seed = hash_seed(header_hash, nonce);
    if !less_equal(&hash_final(&seed, mix_hash), boundary) {
        return Ok(VerificationResult::InvalidFinalHash);
    }
    let expected = hash_kernel(ctx, &seed);
    if !equal(&expected, mix_hash) {
        return Ok(VerificationResult::InvalidMixHash);
    }
    Ok(VerificationResult::Ok)
}
