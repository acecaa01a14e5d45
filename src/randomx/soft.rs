//! Pure-Rust light-VM backend.
//!
//! A memory-hard cache derived from the seed, plus a per-VM scratchpad
//! refilled from the cache on every hash. Each hash runs dependent reads and
//! deterministic write-back over the scratchpad, so hashing needs the whole
//! cache resident while the VM itself stays small.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::backend::RxBackend;
use crate::error::{PowError, PowResult};
use crate::pow::{SeedHash, U256};

const CACHE_DOMAIN: &[u8] = b"hybrid-pow/soft-rx/cache/v1";

/// Soft backend parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftRxParams {
    pub cache_kib: usize,    // shared per seed, e.g. 262144 (256 MiB)
    pub scratch_kib: usize,  // per-VM scratchpad
    pub mix_iters: u32,      // e.g. 16384
    pub reads_per_iter: u32, // 3 or 4 dependent reads per iteration
    pub write_every: u32,    // 0 disables write-back
}

impl Default for SoftRxParams {
    fn default() -> Self {
        Self {
            cache_kib: 256 * 1024,
            scratch_kib: 2 * 1024,
            mix_iters: 16_384,
            reads_per_iter: 4,
            write_every: 4,
        }
    }
}

impl SoftRxParams {
    /// Stable fingerprint for logging, to spot parameter drift between nodes.
    pub fn fingerprint(&self) -> String {
        format!(
            "soft-rx v=1 cache_kib={} scratch_kib={} mix_iters={} reads_per_iter={} write_every={}",
            self.cache_kib, self.scratch_kib, self.mix_iters, self.reads_per_iter, self.write_every,
        )
    }

    /// Anti-DoS limits on hashing cost.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_kib == 0 || self.cache_kib > 1024 * 1024 {
            return Err(format!("cache_kib {} outside 1..=1048576", self.cache_kib));
        }
        if self.scratch_kib == 0 || self.scratch_kib > 128 * 1024 {
            return Err(format!("scratch_kib {} outside 1..=131072", self.scratch_kib));
        }
        if self.mix_iters == 0 || self.mix_iters > 1_000_000 {
            return Err(format!("mix_iters {} outside 1..=1000000", self.mix_iters));
        }
        if !(3..=8).contains(&self.reads_per_iter) {
            return Err(format!("reads_per_iter {} outside 3..=8", self.reads_per_iter));
        }
        Ok(())
    }

    fn cache_words(&self) -> usize {
        pow2_words(self.cache_kib)
    }

    fn scratch_words(&self) -> usize {
        pow2_words(self.scratch_kib)
    }
}

/// KiB -> u64 words, rounded up to a power of two for masking.
fn pow2_words(kib: usize) -> usize {
    (kib * 1024 / std::mem::size_of::<u64>()).max(1).next_power_of_two()
}

/// SplitMix64 PRNG
#[derive(Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline]
    fn next(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

/// Expand 128 bits to 256 bits.
#[inline]
fn expand_256(mut a: u64, mut b: u64) -> U256 {
    for _ in 0..4 {
        a = a.rotate_left(13) ^ b.wrapping_mul(0x9E3779B185EBCA87);
        b = b.rotate_left(17) ^ a.wrapping_mul(0xC2B2AE3D27D4EB4F);
    }
    let mut sm = SplitMix64::new(a ^ b ^ 0xD6E8FEB86659FD93);
    let c = sm.next();
    let d = sm.next();
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&a.to_be_bytes());
    out[8..16].copy_from_slice(&b.to_be_bytes());
    out[16..24].copy_from_slice(&c.to_be_bytes());
    out[24..32].copy_from_slice(&d.to_be_bytes());
    out
}

#[inline]
fn be_u64(chunk: &[u8]) -> u64 {
    let mut v = [0u8; 8];
    v[..chunk.len()].copy_from_slice(chunk);
    u64::from_be_bytes(v)
}

fn try_zeroed(what: &'static str, words: usize) -> PowResult<Vec<u64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(words)
        .map_err(|_| PowError::allocation(what, (words * 8) as u64))?;
    v.resize(words, 0);
    Ok(v)
}

/// Seed-bound cache shared by every VM of a generation.
pub struct SoftCache {
    mem: Vec<u64>,
    mask: usize,
    seed: Option<SeedHash>,
}

impl SoftCache {
    pub fn seed(&self) -> Option<&SeedHash> {
        self.seed.as_ref()
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    fn fill(&mut self, seed: &SeedHash) {
        let digest = Sha256::new()
            .chain_update(CACHE_DOMAIN)
            .chain_update(seed.as_bytes())
            .finalize();
        let mut k = [0u64; 4];
        for (w, chunk) in k.iter_mut().zip(digest.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *w = u64::from_le_bytes(b);
        }

        let mut sm = SplitMix64::new(
            k[0] ^ k[1].rotate_left(17) ^ k[2].rotate_left(31) ^ k[3].rotate_left(47),
        );
        for (i, word) in self.mem.iter_mut().enumerate() {
            *word = sm.next() ^ k[i & 3];
        }
        self.seed = Some(*seed);
    }
}

/// Per-caller execution context: a scratchpad plus the seed it was last
/// bound to.
pub struct SoftVm {
    scratch: Vec<u64>,
    bound: Option<SeedHash>,
}

impl SoftVm {
    pub fn bound_seed(&self) -> Option<&SeedHash> {
        self.bound.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SoftBackend {
    params: SoftRxParams,
}

impl SoftBackend {
    pub fn new(params: SoftRxParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SoftRxParams {
        &self.params
    }

    /// Refill `scratch` from the cache, keyed by the input.
    fn init_scratch(cache: &SoftCache, scratch: &mut [u64], input: &[u8]) {
        let len = input.len() as u64;
        let mut seed: u64 = len ^ 0xDEADBEEFF00DFACE;
        for chunk in input.chunks(8) {
            seed ^= be_u64(chunk).rotate_left(13);
            seed = seed.wrapping_mul(0x9E3779B97F4A7C15).rotate_left(7);
        }

        let mut sm = SplitMix64::new(seed);
        let cmask = cache.mask;
        for slot in scratch.iter_mut() {
            let mix_seed = sm.next();
            let idx1 = (mix_seed.rotate_left(17) as usize) & cmask;
            let idx2 = (mix_seed.rotate_right(23) as usize) & cmask;
            *slot = cache.mem[idx1] ^ cache.mem[idx2] ^ mix_seed.wrapping_mul(0xC2B2AE3D27D4EB4F);
        }
    }

    fn run(&self, cache: &SoftCache, scratch: &mut [u64], input: &[u8]) -> U256 {
        Self::init_scratch(cache, scratch, input);
        let smask = scratch.len() - 1;
        let len = input.len() as u64;

        let mut a: u64 = 0x243F_6A88_85A3_08D3 ^ len.rotate_left(17);
        let mut b: u64 = 0x1319_8A2E_0370_7344 ^ len.rotate_right(11);

        for chunk in input.chunks(16) {
            let x = be_u64(&chunk[..chunk.len().min(8)]);
            let y = if chunk.len() > 8 { be_u64(&chunk[8..]) } else { 0 };
            a ^= x.wrapping_mul(0x9E37_79B1_85EB_CA87);
            b ^= y.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
            a = a.rotate_left(13) ^ b.rotate_right(7);
            b = b.rotate_left(29) ^ a.rotate_right(19);
        }

        let p = &self.params;
        let mut acc = a ^ b ^ 0xDEAD_BEEF_F00D_FACEu64;

        for i in 0..p.mix_iters {
            let j1 = (a ^ b ^ acc ^ (i as u64).wrapping_mul(0x9E3779B9)).rotate_left(17) as usize
                & smask;
            let v1 = scratch[j1];

            let j2 = (v1 ^ a ^ acc).rotate_left(23) as usize & smask;
            let v2 = scratch[j2];

            let j3 = (v2 ^ b ^ acc).rotate_left(19) as usize & smask;
            let v3 = scratch[j3];

            let v4 = if p.reads_per_iter >= 4 {
                let j4 = (v3 ^ v1 ^ acc).rotate_left(29) as usize & smask;
                scratch[j4]
            } else {
                v3
            };

            let mix =
                v1 ^ v2.rotate_left(13) ^ v3.wrapping_mul(0x94D049BB133111EB) ^ v4.rotate_right(7);

            a = a.rotate_left(13) ^ mix.wrapping_mul(0xC2B2AE3D27D4EB4F);
            b = b.rotate_left(17) ^ (mix ^ acc).wrapping_mul(0xBF58476D1CE4E5B9);
            acc = acc.rotate_left(7) ^ (a ^ b).wrapping_mul(0xD6E8FEB86659FD93);

            if p.write_every > 0 && i % p.write_every == 0 {
                let jw = (mix ^ a ^ b.rotate_left(11) ^ (i as u64).wrapping_mul(0xA24BAED4963EE407))
                    .rotate_left(31) as usize
                    & smask;
                scratch[jw] = scratch[jw]
                    .wrapping_add(mix ^ 0x9E3779B97F4A7C15)
                    .rotate_left(41);
            }
        }

        expand_256(a ^ acc, b ^ acc.rotate_left(3))
    }
}

impl RxBackend for SoftBackend {
    type Cache = SoftCache;
    type Vm = SoftVm;

    fn name(&self) -> &'static str {
        "soft"
    }

    fn alloc_cache(&self) -> PowResult<SoftCache> {
        let words = self.params.cache_words();
        let mem = try_zeroed("soft-rx cache", words)?;
        Ok(SoftCache {
            mem,
            mask: words - 1,
            seed: None,
        })
    }

    fn init_cache(&self, cache: &mut SoftCache, seed: &SeedHash) -> PowResult<()> {
        cache.fill(seed);
        Ok(())
    }

    fn create_vm(&self, cache: &SoftCache) -> PowResult<SoftVm> {
        let scratch = try_zeroed("soft-rx scratchpad", self.params.scratch_words())?;
        debug!(target: "hybrid_pow::randomx", words = scratch.len(), "soft vm created");
        Ok(SoftVm {
            scratch,
            bound: cache.seed,
        })
    }

    fn bind_vm(&self, vm: &mut SoftVm, cache: &SoftCache) -> PowResult<()> {
        vm.bound = cache.seed;
        Ok(())
    }

    fn calculate_hash(&self, vm: &mut SoftVm, cache: &SoftCache, input: &[u8]) -> PowResult<U256> {
        let seed = cache
            .seed
            .ok_or(PowError::UninitializedState("soft-rx cache has no seed"))?;
        if vm.bound != Some(seed) {
            return Err(PowError::UninitializedState("soft-rx vm bound to another cache"));
        }
        Ok(self.run(cache, &mut vm.scratch, input))
    }
}
