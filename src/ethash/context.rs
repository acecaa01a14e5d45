//! Epoch contexts: the light cache for one epoch plus an optional full
//! dataset, and the expansion that derives dataset items from the cache.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::hasher::{keccak512, Hash1024, Hash2048, Hash512, Hash512Fn, Keccak512Fn};
use super::sizing::EpochParams;
use super::{
    DATASET_PARENTS, FNV_PRIME, FULL_DATASET_ITEM_SIZE, L1_CACHE_NUM_ITEMS, LIGHT_CACHE_ITEM_SIZE,
    LIGHT_CACHE_ROUNDS,
};
use crate::error::{PowError, PowResult};
use crate::pow::seed::epoch_seed;
use crate::pow::SeedHash;

pub type LightCache = Box<[Hash512]>;
pub type FullDataset = Box<[Hash1024]>;
/// Leading dataset words, 64 per 2048-bit item.
pub type L1Cache = Box<[u32]>;

#[inline]
pub(crate) fn fnv1(u: u32, v: u32) -> u32 {
    u.wrapping_mul(FNV_PRIME) ^ v
}

/// What an [`EpochContext`] carries besides its light cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    pub full_dataset: bool,
    /// Mirror the first [`L1_CACHE_SIZE`](super::L1_CACHE_SIZE) bytes of the
    /// dataset as 32-bit words.
    pub l1_cache: bool,
    /// Cap on the total bytes of the context.
    pub memory_limit: Option<u64>,
}

/// Everything needed to hash within one epoch. Immutable once built and safe
/// to share between threads.
pub struct EpochContext {
    epoch: u64,
    epoch_length: u64,
    seed: SeedHash,
    light_cache: LightCache,
    l1_cache: Option<L1Cache>,
    full_dataset: Option<FullDataset>,
    full_dataset_num_items: u32,
}

impl std::fmt::Debug for EpochContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochContext")
            .field("epoch", &self.epoch)
            .field("seed", &self.seed)
            .field("light_cache_items", &self.light_cache.len())
            .field("full_dataset_items", &self.full_dataset_num_items)
            .field("full", &self.full_dataset.is_some())
            .field("l1", &self.l1_cache.is_some())
            .finish()
    }
}

/// Bytes a context for `epoch` occupies.
pub fn context_bytes(params: &EpochParams, epoch: u64, want_full: bool) -> u64 {
    let light = params.light_cache_size(epoch);
    if want_full {
        light + params.full_dataset_size(epoch)
    } else {
        light
    }
}

/// 2048-bit items mirrored into the L1 cache for a dataset of `full_items`.
fn l1_num_items(full_items: u32) -> u32 {
    L1_CACHE_NUM_ITEMS.min(full_items / 2)
}

/// Build a context with Keccak-512 and the canonical seed for `epoch`.
pub fn create_epoch_context(
    params: &EpochParams,
    epoch: u64,
    want_full: bool,
) -> PowResult<EpochContext> {
    EpochContext::build(params, &Keccak512Fn, epoch, &epoch_seed(epoch), want_full, None)
}

impl EpochContext {
    /// Build the light cache for `seed` and, if `want_full`, the full dataset.
    ///
    /// `memory_limit` caps the total bytes of the context. Exceeding it, or
    /// failing to reserve the buffers, returns [`PowError::Allocation`] and
    /// nothing is kept.
    pub fn build<H: Hash512Fn + ?Sized>(
        params: &EpochParams,
        hasher: &H,
        epoch: u64,
        seed: &SeedHash,
        want_full: bool,
        memory_limit: Option<u64>,
    ) -> PowResult<Self> {
        let opts = ContextOptions {
            full_dataset: want_full,
            l1_cache: false,
            memory_limit,
        };
        Self::build_with(params, hasher, epoch, || *seed, opts)
    }

    /// Like [`build`](Self::build), but `seed` is only called once sizing,
    /// the memory limit and every buffer reservation have passed.
    pub fn build_with<H, S>(
        params: &EpochParams,
        hasher: &H,
        epoch: u64,
        seed: S,
        opts: ContextOptions,
    ) -> PowResult<Self>
    where
        H: Hash512Fn + ?Sized,
        S: FnOnce() -> SeedHash,
    {
        let light_items = params.light_cache_num_items(epoch);
        let full_items = params.full_dataset_num_items(epoch);
        if light_items == 0 || full_items == 0 {
            return Err(PowError::Config(format!(
                "epoch {epoch} sizing yields an empty cache or dataset"
            )));
        }
        let l1_words = if opts.l1_cache {
            l1_num_items(full_items) as usize * 64
        } else {
            0
        };

        let required = context_bytes(params, epoch, opts.full_dataset) + l1_words as u64 * 4;
        if let Some(limit) = opts.memory_limit {
            if required > limit {
                warn!(
                    target: "hybrid_pow::ethash",
                    epoch, required, limit, "epoch context exceeds memory limit"
                );
                return Err(PowError::allocation("epoch context", required));
            }
        }

        let light_buf = try_alloc("light cache", light_items as usize, LIGHT_CACHE_ITEM_SIZE)?;
        let full_buf = if opts.full_dataset {
            Some(try_alloc("full dataset", full_items as usize, FULL_DATASET_ITEM_SIZE)?)
        } else {
            None
        };
        let l1_buf = if l1_words > 0 {
            Some(try_alloc("l1 cache", l1_words, 4)?)
        } else {
            None
        };
        let seed = seed();

        let started = Instant::now();
        let light_cache = fill_light_cache(hasher, light_buf, light_items as usize, &seed);
        debug!(
            target: "hybrid_pow::ethash",
            epoch,
            items = light_items,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "light cache built"
        );

        let full_dataset = full_buf.map(|buf| {
            let started = Instant::now();
            let full = fill_full_dataset(&light_cache, buf, full_items);
            debug!(
                target: "hybrid_pow::ethash",
                epoch,
                items = full_items,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "full dataset built"
            );
            full
        });
        let l1_cache = l1_buf.map(|buf| fill_l1_cache(&light_cache, buf, l1_num_items(full_items)));

        Ok(EpochContext {
            epoch,
            epoch_length: params.epoch_length,
            seed,
            light_cache,
            l1_cache,
            full_dataset,
            full_dataset_num_items: full_items,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    pub fn seed(&self) -> &SeedHash {
        &self.seed
    }

    pub fn light_cache(&self) -> &[Hash512] {
        &self.light_cache
    }

    pub fn full_dataset(&self) -> Option<&[Hash1024]> {
        self.full_dataset.as_deref()
    }

    pub fn has_full_dataset(&self) -> bool {
        self.full_dataset.is_some()
    }

    pub fn l1_cache(&self) -> Option<&[u32]> {
        self.l1_cache.as_deref()
    }

    pub fn dataset_num_items(&self) -> u32 {
        self.full_dataset_num_items
    }

    /// Number of whole 2048-bit items in the dataset.
    pub fn dataset_num_items_2048(&self) -> u32 {
        self.full_dataset_num_items / 2
    }

    /// Heap bytes held by the cache, dataset and L1 mirror.
    pub fn memory_bytes(&self) -> u64 {
        let light = self.light_cache.len() as u64 * LIGHT_CACHE_ITEM_SIZE;
        let full = self
            .full_dataset
            .as_ref()
            .map(|d| d.len() as u64 * FULL_DATASET_ITEM_SIZE)
            .unwrap_or(0);
        let l1 = self.l1_cache.as_ref().map(|l| l.len() as u64 * 4).unwrap_or(0);
        light + full + l1
    }

    /// Dataset item `index`, from the full dataset if built, otherwise
    /// computed from the light cache. `None` past the end of the dataset.
    pub fn dataset_item(&self, index: u32) -> Option<Hash1024> {
        if index >= self.full_dataset_num_items {
            return None;
        }
        Some(self.item(index))
    }

    /// 2048-bit item `index`, covering 1024-bit items `2 * index` and
    /// `2 * index + 1`.
    pub fn dataset_item_2048(&self, index: u32) -> Option<Hash2048> {
        if index >= self.dataset_num_items_2048() {
            return None;
        }
        Some(match &self.full_dataset {
            Some(full) => {
                let i = index as usize * 2;
                Hash2048::from_pair(&full[i], &full[i + 1])
            }
            None => calculate_dataset_item_2048(&self.light_cache, index),
        })
    }

    /// Same as [`dataset_item`](Self::dataset_item) for an index already
    /// reduced modulo the dataset size.
    #[inline]
    pub(crate) fn item(&self, index: u32) -> Hash1024 {
        match &self.full_dataset {
            Some(full) => full[index as usize],
            None => calculate_dataset_item_1024(&self.light_cache, index),
        }
    }
}

fn try_alloc<T>(what: &'static str, len: usize, item_size: u64) -> PowResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| {
        let bytes = len as u64 * item_size;
        warn!(target: "hybrid_pow::ethash", what, bytes, "allocation failed");
        PowError::allocation(what, bytes)
    })?;
    Ok(v)
}

/// Sequential hash chain from the seed followed by `LIGHT_CACHE_ROUNDS`
/// rounds of RandMemoHash.
pub fn build_light_cache<H: Hash512Fn + ?Sized>(
    hasher: &H,
    num_items: usize,
    seed: &SeedHash,
) -> PowResult<LightCache> {
    let buf = try_alloc("light cache", num_items, LIGHT_CACHE_ITEM_SIZE)?;
    Ok(fill_light_cache(hasher, buf, num_items, seed))
}

fn fill_light_cache<H: Hash512Fn + ?Sized>(
    hasher: &H,
    mut cache: Vec<Hash512>,
    num_items: usize,
    seed: &SeedHash,
) -> LightCache {
    if num_items == 0 {
        return cache.into_boxed_slice();
    }

    let mut item = hasher.hash512(seed.as_bytes());
    cache.push(item);
    for _ in 1..num_items {
        item = hasher.hash512(&item.to_bytes());
        cache.push(item);
    }

    for _ in 0..LIGHT_CACHE_ROUNDS {
        for i in 0..num_items {
            let v = cache[i].word(0) as usize % num_items;
            let w = (num_items + i - 1) % num_items;
            let x = cache[v].xor(&cache[w]);
            cache[i] = hasher.hash512(&x.to_bytes());
        }
    }

    cache.into_boxed_slice()
}

fn calculate_dataset_item_512(cache: &[Hash512], index: u64) -> Hash512 {
    let n = cache.len() as u64;
    let seed = index as u32;

    let mut mix = cache[(index % n) as usize];
    mix.0[0] ^= seed;
    mix = keccak512(&mix.to_bytes());

    for round in 0..DATASET_PARENTS {
        let t = fnv1(seed ^ round, mix.0[(round % 16) as usize]);
        let parent = &cache[(t as u64 % n) as usize];
        for (m, p) in mix.0.iter_mut().zip(parent.0.iter()) {
            *m = fnv1(*m, *p);
        }
    }

    keccak512(&mix.to_bytes())
}

/// Dataset item `index`: sub-items `2 * index` and `2 * index + 1`.
pub fn calculate_dataset_item_1024(cache: &[Hash512], index: u32) -> Hash1024 {
    let base = index as u64 * 2;
    Hash1024([
        calculate_dataset_item_512(cache, base),
        calculate_dataset_item_512(cache, base + 1),
    ])
}

/// Wide dataset item `index`: sub-items `4 * index` through `4 * index + 3`.
pub fn calculate_dataset_item_2048(cache: &[Hash512], index: u32) -> Hash2048 {
    let base = index as u64 * 4;
    Hash2048([
        calculate_dataset_item_512(cache, base),
        calculate_dataset_item_512(cache, base + 1),
        calculate_dataset_item_512(cache, base + 2),
        calculate_dataset_item_512(cache, base + 3),
    ])
}

fn fill_full_dataset(cache: &[Hash512], mut items: Vec<Hash1024>, num_items: u32) -> FullDataset {
    (0..num_items)
        .into_par_iter()
        .map(|i| calculate_dataset_item_1024(cache, i))
        .collect_into_vec(&mut items);
    items.into_boxed_slice()
}

fn fill_l1_cache(cache: &[Hash512], mut words: Vec<u32>, num_items: u32) -> L1Cache {
    for i in 0..num_items {
        words.extend_from_slice(&calculate_dataset_item_2048(cache, i).words());
    }
    words.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devnet(epoch: u64, full: bool) -> EpochContext {
        create_epoch_context(&EpochParams::devnet(), epoch, full).unwrap()
    }

    #[test]
    fn test_light_cache_golden() {
        let ctx = devnet(0, false);
        let cache = ctx.light_cache();
        assert_eq!(cache.len(), 61);
        assert_eq!(
            cache[0].to_hex(),
            "d0dc7cb32058210ea7888e2a37cd7f306f14033b250c4f8c7f4eb87237849424\
             a2ae146f6199c07ffe039282577b80ecae0885bf72c52c97d15adf5b52f518fc"
        );
        assert_eq!(
            cache[60].to_hex(),
            "6059d2d4f554b92720d11b5471cb605b7d3e3313df722d4db8a1aa992dd38332\
             144783d1e8d2027c0faba695fa7733d7c4d7bfaf6e08f7adafc45f125bfc15ae"
        );

        let ctx = devnet(3, false);
        assert_eq!(ctx.light_cache().len(), 109);
        assert_eq!(
            ctx.seed().to_hex(),
            "356e5a2cc1eba076e650ac7473fccc37952b46bc2e419a200cec0c451dce2336"
        );
        assert_eq!(
            ctx.light_cache()[0].to_hex(),
            "0cb39d5b520b30ff33fbf7416326056cd52a79fffeb16554870e45943bd8d2bd\
             103ac876ce9d94147b4e291a16e1150137c51b1f33c166e88957901a63e1bf91"
        );
    }

    #[test]
    fn test_dataset_item_golden() {
        let expected = "2bb450d70d78d9be5c1cb12f16c24a706cc1aab305a293a2b7e3e13403dd2bf2\
                        39f56aafa9a85186ce1a538022ac3a6ec589be5f3a1fe2e21508a97dc98abf53\
                        66123496e2b7d74018c2876bf90c3e2b185c0a5171b709f3ccd46d94be400336\
                        b64c14d6f0ec4f0b532b5f1612c47cd7beeb3fd205d777af9a659b78cfd67013";
        let light = devnet(0, false);
        let full = devnet(0, true);
        assert_eq!(light.dataset_item(7).unwrap().to_hex(), expected);
        assert_eq!(full.dataset_item(7).unwrap().to_hex(), expected);
    }

    #[test]
    fn test_dataset_light_and_full_agree() {
        let light = devnet(0, false);
        let full = devnet(0, true);
        assert!(!light.has_full_dataset());
        assert!(full.has_full_dataset());
        assert_eq!(full.full_dataset().unwrap().len(), 509);

        for i in 0..full.dataset_num_items() {
            assert_eq!(light.dataset_item(i), full.dataset_item(i), "item {i}");
        }
        assert_eq!(light.dataset_item(509), None);
        assert_eq!(full.dataset_item(u32::MAX), None);
    }

    #[test]
    fn test_dataset_item_2048_light_and_full_agree() {
        let light = devnet(0, false);
        let full = devnet(0, true);
        assert_eq!(light.dataset_num_items_2048(), 254);
        for i in 0..light.dataset_num_items_2048() {
            let wide = light.dataset_item_2048(i).unwrap();
            assert_eq!(Some(wide), full.dataset_item_2048(i), "item {i}");
            let lo = light.dataset_item(2 * i).unwrap();
            let hi = light.dataset_item(2 * i + 1).unwrap();
            assert_eq!(wide, Hash2048::from_pair(&lo, &hi), "item {i}");
        }
        // The odd trailing 1024-bit item has no partner.
        assert_eq!(light.dataset_item_2048(254), None);
        assert_eq!(full.dataset_item_2048(254), None);
    }

    #[test]
    fn test_l1_cache_mirrors_dataset_prefix() {
        let params = EpochParams::devnet();
        let opts = ContextOptions {
            full_dataset: true,
            l1_cache: true,
            memory_limit: None,
        };
        let ctx = EpochContext::build_with(&params, &Keccak512Fn, 1, || epoch_seed(1), opts).unwrap();
        let l1 = ctx.l1_cache().unwrap();
        assert_eq!(l1.len() as u64 * 4, crate::ethash::L1_CACHE_SIZE);

        let full = ctx.full_dataset().unwrap();
        let prefix: Vec<u32> = full[..128].iter().flat_map(|item| item.words()).collect();
        assert_eq!(l1, &prefix[..]);
        assert_eq!(
            ctx.memory_bytes(),
            context_bytes(&params, 1, true) + crate::ethash::L1_CACHE_SIZE
        );

        assert!(devnet(1, true).l1_cache().is_none());
    }

    #[test]
    fn test_seed_is_derived_after_reservations() {
        let params = EpochParams::devnet();
        let asked = std::cell::Cell::new(false);
        let opts = ContextOptions {
            full_dataset: true,
            l1_cache: false,
            memory_limit: Some(64),
        };
        let err = EpochContext::build_with(
            &params,
            &Keccak512Fn,
            0,
            || {
                asked.set(true);
                SeedHash::ZERO
            },
            opts,
        )
        .unwrap_err();
        assert!(err.is_allocation());
        assert!(!asked.get());

        let opts = ContextOptions {
            memory_limit: None,
            ..opts
        };
        let ctx = EpochContext::build_with(
            &params,
            &Keccak512Fn,
            0,
            || {
                asked.set(true);
                SeedHash::ZERO
            },
            opts,
        )
        .unwrap();
        assert!(asked.get());
        assert_eq!(ctx.light_cache(), devnet(0, false).light_cache());
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = devnet(2, false);
        let b = devnet(2, false);
        assert_eq!(a.light_cache(), b.light_cache());
        assert_eq!(a.seed(), b.seed());
    }

    #[test]
    fn test_memory_limit_rejects_build() {
        let params = EpochParams::devnet();
        let needed = context_bytes(&params, 0, true);
        assert_eq!(needed, 61 * 64 + 509 * 128);

        let err = EpochContext::build(&params, &Keccak512Fn, 0, &SeedHash::ZERO, true, Some(needed - 1))
            .unwrap_err();
        assert_eq!(err, PowError::allocation("epoch context", needed));

        let ctx = EpochContext::build(&params, &Keccak512Fn, 0, &SeedHash::ZERO, true, Some(needed))
            .unwrap();
        assert_eq!(ctx.memory_bytes(), needed);
    }

    #[test]
    fn test_injected_hasher_is_used() {
        let params = EpochParams::devnet();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let counting = |data: &[u8]| {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            keccak512(data)
        };
        let ctx = EpochContext::build(&params, &counting, 0, &SeedHash::ZERO, false, None).unwrap();
        // One chain pass plus three rounds.
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 61 * 4);
        assert_eq!(ctx.light_cache(), devnet(0, false).light_cache());

        let flipped = |data: &[u8]| {
            let mut h = keccak512(data);
            h.0[0] ^= 1;
            h
        };
        let other = EpochContext::build(&params, &flipped, 0, &SeedHash::ZERO, false, None).unwrap();
        assert_ne!(other.light_cache(), ctx.light_cache());
    }
}
