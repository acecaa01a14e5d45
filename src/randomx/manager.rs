//! Two-generation cache/VM manager.
//!
//! `main` holds the seed the node verifies against most, and only moves on
//! [`RxCacheManager::set_main_seed`]. `secondary` rotates to whatever other
//! seed a hash request brings. Each generation owns one cache and a pool of
//! idle VMs bound to it. A caller leases a private VM under the generation
//! lock, hashes unlocked, and parks the VM again afterwards.
//!
//! Lock order: `main` is never held while taking `secondary`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::RxBackend;
use crate::error::{PowError, PowResult};
use crate::metrics;
use crate::pow::{SeedHash, U256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationRole {
    Main,
    Secondary,
}

impl GenerationRole {
    fn as_str(&self) -> &'static str {
        match self {
            GenerationRole::Main => "main",
            GenerationRole::Secondary => "secondary",
        }
    }
}

/// `Initializing` is only observable from outside if a backend panicked
/// mid-initialization; such a generation is treated like `Unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Unset,
    Initializing,
    Ready,
}

/// Which tier served a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashPath {
    /// Seed matched `main`.
    Fast,
    /// Seed matched `secondary`, or `secondary` was initialized for it the
    /// first time.
    Slow,
    /// `secondary` was evicted and reinitialized for the seed.
    Slowest,
}

impl HashPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashPath::Fast => "fast",
            HashPath::Slow => "slow",
            HashPath::Slowest => "slowest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub role: GenerationRole,
    pub state: GenerationState,
    pub seed: Option<SeedHash>,
    /// Bumped on every successful cache initialization.
    pub version: u64,
    pub idle_vms: usize,
}

#[derive(Debug, Default)]
struct RxStats {
    main_inits: AtomicU64,
    secondary_inits: AtomicU64,
    vm_creates: AtomicU64,
    vm_rebinds: AtomicU64,
    fast_hashes: AtomicU64,
    slow_hashes: AtomicU64,
    slowest_hashes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxStatsSnapshot {
    pub main_inits: u64,
    pub secondary_inits: u64,
    pub vm_creates: u64,
    pub vm_rebinds: u64,
    pub fast_hashes: u64,
    pub slow_hashes: u64,
    pub slowest_hashes: u64,
}

impl RxStats {
    fn record_init(&self, role: GenerationRole) {
        match role {
            GenerationRole::Main => self.main_inits.fetch_add(1, Ordering::Relaxed),
            GenerationRole::Secondary => self.secondary_inits.fetch_add(1, Ordering::Relaxed),
        };
        metrics::RX_CACHE_INITS.with_label_values(&[role.as_str()]).inc();
    }

    fn record_path(&self, path: HashPath) {
        match path {
            HashPath::Fast => self.fast_hashes.fetch_add(1, Ordering::Relaxed),
            HashPath::Slow => self.slow_hashes.fetch_add(1, Ordering::Relaxed),
            HashPath::Slowest => self.slowest_hashes.fetch_add(1, Ordering::Relaxed),
        };
        metrics::RX_HASHES.with_label_values(&[path.as_str()]).inc();
    }

    fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            main_inits: self.main_inits.load(Ordering::Relaxed),
            secondary_inits: self.secondary_inits.load(Ordering::Relaxed),
            vm_creates: self.vm_creates.load(Ordering::Relaxed),
            vm_rebinds: self.vm_rebinds.load(Ordering::Relaxed),
            fast_hashes: self.fast_hashes.load(Ordering::Relaxed),
            slow_hashes: self.slow_hashes.load(Ordering::Relaxed),
            slowest_hashes: self.slowest_hashes.load(Ordering::Relaxed),
        }
    }
}

struct ParkedVm<V> {
    vm: V,
    version: u64,
}

/// A VM checked out of a generation together with the cache it is bound to.
struct VmLease<B: RxBackend> {
    vm: B::Vm,
    cache: Arc<B::Cache>,
    version: u64,
}

struct Generation<B: RxBackend> {
    role: GenerationRole,
    state: GenerationState,
    seed: SeedHash,
    cache: Option<Arc<B::Cache>>,
    version: u64,
    idle: Vec<ParkedVm<B::Vm>>,
}

impl<B: RxBackend> Generation<B> {
    fn new(role: GenerationRole) -> Self {
        Self {
            role,
            state: GenerationState::Unset,
            seed: SeedHash::ZERO,
            cache: None,
            version: 0,
            idle: Vec::new(),
        }
    }

    fn holds(&self, seed: &SeedHash) -> bool {
        self.state == GenerationState::Ready && self.seed == *seed
    }

    fn info(&self) -> GenerationInfo {
        GenerationInfo {
            role: self.role,
            state: self.state,
            seed: (self.state == GenerationState::Ready).then_some(self.seed),
            version: self.version,
            idle_vms: self.idle.len(),
        }
    }

    /// Fill the cache for `seed`, in place when no lease still holds it, and
    /// rebind every parked VM to the result. On failure the generation is
    /// left `Unset` with no cache and no parked VMs.
    fn reinitialize(&mut self, backend: &B, seed: &SeedHash, stats: &RxStats) -> PowResult<()> {
        self.state = GenerationState::Initializing;
        let started = Instant::now();

        let reused = self.cache.take().and_then(|c| Arc::try_unwrap(c).ok());
        let in_place = reused.is_some();
        let outcome = match reused {
            Some(cache) => Ok(cache),
            None => backend.alloc_cache(),
        }
        .and_then(|mut cache| {
            backend.init_cache(&mut cache, seed)?;
            Ok(cache)
        });

        match outcome {
            Ok(cache) => {
                self.cache = Some(Arc::new(cache));
                self.seed = *seed;
                self.version += 1;
                self.state = GenerationState::Ready;
                self.rebind_idle(backend, stats);
                info!(
                    target: "hybrid_pow::randomx",
                    generation = self.role.as_str(),
                    seed = %seed,
                    version = self.version,
                    in_place,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cache initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.seed = SeedHash::ZERO;
                self.state = GenerationState::Unset;
                self.idle.clear();
                warn!(
                    target: "hybrid_pow::randomx",
                    generation = self.role.as_str(),
                    seed = %seed,
                    error = %e,
                    "cache initialization failed"
                );
                Err(e)
            }
        }
    }

    /// Parked VMs keep whatever cache they were last bound to alive, so
    /// they follow the cache to its new version or are dropped.
    fn rebind_idle(&mut self, backend: &B, stats: &RxStats) {
        let Some(cache) = self.cache.clone() else {
            self.idle.clear();
            return;
        };
        let version = self.version;
        let role = self.role.as_str();
        self.idle.retain_mut(|parked| {
            if parked.version == version {
                return true;
            }
            match backend.bind_vm(&mut parked.vm, &cache) {
                Ok(()) => {
                    parked.version = version;
                    stats.vm_rebinds.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    warn!(target: "hybrid_pow::randomx", generation = role, error = %e, "dropping vm that failed to rebind");
                    false
                }
            }
        });
    }

    /// Check out a VM bound to the current cache. Parked VMs from an older
    /// version are rebound rather than recreated.
    fn lease(&mut self, backend: &B, stats: &RxStats) -> PowResult<VmLease<B>> {
        if self.state != GenerationState::Ready {
            return Err(PowError::UninitializedState("lease from a generation that is not ready"));
        }
        let cache = self
            .cache
            .clone()
            .ok_or(PowError::UninitializedState("ready generation without cache"))?;

        let vm = match self.idle.pop() {
            Some(parked) if parked.version == self.version => parked.vm,
            Some(mut parked) => {
                backend.bind_vm(&mut parked.vm, &cache)?;
                stats.vm_rebinds.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "hybrid_pow::randomx",
                    generation = self.role.as_str(),
                    from = parked.version,
                    to = self.version,
                    "vm rebound"
                );
                parked.vm
            }
            None => {
                let vm = backend.create_vm(&cache)?;
                stats.vm_creates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "hybrid_pow::randomx",
                    generation = self.role.as_str(),
                    version = self.version,
                    "vm created"
                );
                vm
            }
        };

        Ok(VmLease {
            vm,
            cache,
            version: self.version,
        })
    }

    /// Return a VM to the pool. A VM leased before the last reinit is
    /// dropped so it cannot pin the old cache.
    fn park(&mut self, vm: B::Vm, version: u64, max_idle: usize) {
        if version != self.version || self.state != GenerationState::Ready {
            debug!(
                target: "hybrid_pow::randomx",
                generation = self.role.as_str(),
                from = version,
                current = self.version,
                "stale vm dropped"
            );
            return;
        }
        if self.idle.len() < max_idle {
            self.idle.push(ParkedVm { vm, version });
        }
    }
}

/// Owns the `main` and `secondary` generations for one backend.
pub struct RxCacheManager<B: RxBackend> {
    backend: B,
    main: Mutex<Generation<B>>,
    secondary: Mutex<Generation<B>>,
    max_idle_vms: usize,
    stats: RxStats,
}

impl<B: RxBackend> RxCacheManager<B> {
    pub fn new(backend: B, max_idle_vms: usize) -> Self {
        info!(
            target: "hybrid_pow::randomx",
            backend = backend.name(),
            max_idle_vms,
            "randomx manager created"
        );
        Self {
            backend,
            main: Mutex::new(Generation::new(GenerationRole::Main)),
            secondary: Mutex::new(Generation::new(GenerationRole::Secondary)),
            max_idle_vms,
            stats: RxStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Point `main` at `seed`. A no-op when `main` already holds it.
    pub fn set_main_seed(&self, seed: &SeedHash) -> PowResult<()> {
        let mut main = self.main.lock();
        if main.holds(seed) {
            return Ok(());
        }
        main.reinitialize(&self.backend, seed, &self.stats)?;
        self.stats.record_init(GenerationRole::Main);
        Ok(())
    }

    /// Hash `input` against the cache for `seed`.
    pub fn hash(&self, seed: &SeedHash, input: &[u8]) -> PowResult<U256> {
        self.hash_with_path(seed, input).map(|(out, _)| out)
    }

    /// Like [`hash`](Self::hash), also reporting which tier served it.
    pub fn hash_with_path(&self, seed: &SeedHash, input: &[u8]) -> PowResult<(U256, HashPath)> {
        {
            let mut main = self.main.lock();
            if main.holds(seed) {
                let lease = main.lease(&self.backend, &self.stats)?;
                drop(main);
                self.stats.record_path(HashPath::Fast);
                return self.run(&self.main, lease, input).map(|h| (h, HashPath::Fast));
            }
        }

        let mut secondary = self.secondary.lock();
        let path = if secondary.holds(seed) {
            HashPath::Slow
        } else {
            let first = secondary.state != GenerationState::Ready;
            secondary.reinitialize(&self.backend, seed, &self.stats)?;
            self.stats.record_init(GenerationRole::Secondary);
            if first {
                HashPath::Slow
            } else {
                HashPath::Slowest
            }
        };
        let lease = secondary.lease(&self.backend, &self.stats)?;
        drop(secondary);

        debug!(target: "hybrid_pow::randomx", seed = %seed, path = path.as_str(), "secondary hash");
        self.stats.record_path(path);
        self.run(&self.secondary, lease, input).map(|h| (h, path))
    }

    /// Hash with the lease, then park its VM. A VM whose hash failed is
    /// dropped rather than reused.
    fn run(&self, generation: &Mutex<Generation<B>>, lease: VmLease<B>, input: &[u8]) -> PowResult<U256> {
        let VmLease {
            mut vm,
            cache,
            version,
        } = lease;
        let out = self.backend.calculate_hash(&mut vm, &cache, input);
        // Release the cache before parking so the next reinit can reuse it.
        drop(cache);
        if out.is_ok() {
            generation.lock().park(vm, version, self.max_idle_vms);
        }
        out
    }

    pub fn main_seed(&self) -> Option<SeedHash> {
        self.main.lock().info().seed
    }

    pub fn secondary_seed(&self) -> Option<SeedHash> {
        self.secondary.lock().info().seed
    }

    pub fn main_info(&self) -> GenerationInfo {
        self.main.lock().info()
    }

    pub fn secondary_info(&self) -> GenerationInfo {
        self.secondary.lock().info()
    }

    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Cache records its seed; hash = seed bytes xor input bytes, cycled.
    #[derive(Default)]
    struct MockBackend {
        allocs: AtomicU64,
        inits: AtomicU64,
        fail_alloc: AtomicBool,
        fail_hash: AtomicBool,
    }

    struct MockCache {
        seed: Option<SeedHash>,
    }

    struct MockVm {
        bound: Option<SeedHash>,
    }

    impl RxBackend for MockBackend {
        type Cache = MockCache;
        type Vm = MockVm;

        fn name(&self) -> &'static str {
            "mock"
        }

        fn alloc_cache(&self) -> PowResult<MockCache> {
            if self.fail_alloc.load(Ordering::SeqCst) {
                return Err(PowError::allocation("mock cache", 1 << 20));
            }
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(MockCache { seed: None })
        }

        fn init_cache(&self, cache: &mut MockCache, seed: &SeedHash) -> PowResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            cache.seed = Some(*seed);
            Ok(())
        }

        fn create_vm(&self, cache: &MockCache) -> PowResult<MockVm> {
            Ok(MockVm { bound: cache.seed })
        }

        fn bind_vm(&self, vm: &mut MockVm, cache: &MockCache) -> PowResult<()> {
            vm.bound = cache.seed;
            Ok(())
        }

        fn calculate_hash(&self, vm: &mut MockVm, cache: &MockCache, input: &[u8]) -> PowResult<U256> {
            if self.fail_hash.load(Ordering::SeqCst) {
                return Err(PowError::Backend("mock hash failure".into()));
            }
            let seed = cache.seed.ok_or(PowError::UninitializedState("mock cache"))?;
            assert_eq!(vm.bound, Some(seed), "vm used against a cache it is not bound to");
            let mut out = *seed.as_bytes();
            for (i, b) in input.iter().enumerate() {
                out[i % 32] ^= b;
            }
            Ok(out)
        }
    }

    fn expected(seed: &SeedHash, input: &[u8]) -> U256 {
        let mut out = *seed.as_bytes();
        for (i, b) in input.iter().enumerate() {
            out[i % 32] ^= b;
        }
        out
    }

    fn s(b: u8) -> SeedHash {
        SeedHash::new([b; 32])
    }

    #[test]
    fn test_set_main_seed_is_idempotent() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        m.set_main_seed(&s(1)).unwrap();
        m.set_main_seed(&s(1)).unwrap();
        assert_eq!(m.stats().main_inits, 1);
        assert_eq!(m.backend().inits.load(Ordering::SeqCst), 1);
        assert_eq!(m.main_seed(), Some(s(1)));
    }

    #[test]
    fn test_main_reinit_reuses_cache() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        m.set_main_seed(&s(1)).unwrap();
        m.hash(&s(1), b"abc").unwrap();
        m.set_main_seed(&s(2)).unwrap();
        assert_eq!(m.backend().allocs.load(Ordering::SeqCst), 1);
        assert_eq!(m.main_info().version, 2);

        // The parked VM is rebound, not recreated.
        assert_eq!(m.hash(&s(2), b"abc").unwrap(), expected(&s(2), b"abc"));
        let stats = m.stats();
        assert_eq!(stats.vm_creates, 1);
        assert_eq!(stats.vm_rebinds, 1);
        assert_eq!(stats.fast_hashes, 2);
    }

    #[test]
    fn test_hash_paths() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        m.set_main_seed(&s(1)).unwrap();

        assert_eq!(m.hash_with_path(&s(1), b"x").unwrap().1, HashPath::Fast);
        assert_eq!(m.hash_with_path(&s(2), b"x").unwrap().1, HashPath::Slow);
        assert_eq!(m.hash_with_path(&s(2), b"x").unwrap().1, HashPath::Slow);
        assert_eq!(m.hash_with_path(&s(3), b"x").unwrap(), (expected(&s(3), b"x"), HashPath::Slowest));

        assert_eq!(m.main_seed(), Some(s(1)));
        assert_eq!(m.secondary_seed(), Some(s(3)));
        let stats = m.stats();
        assert_eq!(stats.main_inits, 1);
        assert_eq!(stats.secondary_inits, 2);
        assert_eq!((stats.fast_hashes, stats.slow_hashes, stats.slowest_hashes), (1, 2, 1));
    }

    #[test]
    fn test_unset_main_routes_to_secondary() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        assert_eq!(m.hash(&s(9), b"q").unwrap(), expected(&s(9), b"q"));
        assert_eq!(m.main_info().state, GenerationState::Unset);
        assert_eq!(m.secondary_seed(), Some(s(9)));
    }

    #[test]
    fn test_allocation_failure_leaves_generation_unset() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        m.backend().fail_alloc.store(true, Ordering::SeqCst);

        assert!(m.set_main_seed(&s(1)).unwrap_err().is_allocation());
        assert_eq!(m.main_info().state, GenerationState::Unset);
        assert_eq!(m.main_seed(), None);

        assert!(m.hash(&s(2), b"x").unwrap_err().is_allocation());
        assert_eq!(m.secondary_info().state, GenerationState::Unset);

        m.backend().fail_alloc.store(false, Ordering::SeqCst);
        m.set_main_seed(&s(1)).unwrap();
        assert_eq!(m.main_seed(), Some(s(1)));
        assert_eq!(m.stats().main_inits, 1);
    }

    #[test]
    fn test_failed_hash_drops_vm() {
        let m = RxCacheManager::new(MockBackend::default(), 4);
        m.set_main_seed(&s(1)).unwrap();
        m.backend().fail_hash.store(true, Ordering::SeqCst);
        assert!(matches!(m.hash(&s(1), b"x"), Err(PowError::Backend(_))));
        assert_eq!(m.main_info().idle_vms, 0);

        m.backend().fail_hash.store(false, Ordering::SeqCst);
        m.hash(&s(1), b"x").unwrap();
        assert_eq!(m.main_info().idle_vms, 1);
        assert_eq!(m.stats().vm_creates, 2);
    }

    /// VMs keep their own reference to the cache contents they were bound
    /// to, and every init allocates fresh contents.
    #[derive(Default)]
    struct PinningBackend {
        contents: Mutex<Vec<std::sync::Weak<SeedHash>>>,
    }

    struct PinnedCache {
        contents: Option<Arc<SeedHash>>,
    }

    struct PinningVm {
        contents: Option<Arc<SeedHash>>,
    }

    impl PinningBackend {
        fn live_contents(&self) -> usize {
            self.contents.lock().iter().filter(|w| w.strong_count() > 0).count()
        }
    }

    impl RxBackend for PinningBackend {
        type Cache = PinnedCache;
        type Vm = PinningVm;

        fn name(&self) -> &'static str {
            "pinning"
        }

        fn alloc_cache(&self) -> PowResult<PinnedCache> {
            Ok(PinnedCache { contents: None })
        }

        fn init_cache(&self, cache: &mut PinnedCache, seed: &SeedHash) -> PowResult<()> {
            let contents = Arc::new(*seed);
            self.contents.lock().push(Arc::downgrade(&contents));
            cache.contents = Some(contents);
            Ok(())
        }

        fn create_vm(&self, cache: &PinnedCache) -> PowResult<PinningVm> {
            Ok(PinningVm {
                contents: cache.contents.clone(),
            })
        }

        fn bind_vm(&self, vm: &mut PinningVm, cache: &PinnedCache) -> PowResult<()> {
            vm.contents = cache.contents.clone();
            Ok(())
        }

        fn calculate_hash(&self, vm: &mut PinningVm, cache: &PinnedCache, input: &[u8]) -> PowResult<U256> {
            let seed = vm.contents.as_deref().ok_or(PowError::UninitializedState("vm"))?;
            assert_eq!(cache.contents.as_deref(), Some(seed));
            Ok(expected(seed, input))
        }
    }

    fn hash_with_leases<B: RxBackend>(m: &RxCacheManager<B>, seed: &SeedHash, leases: usize) {
        let held: Vec<_> = {
            let mut main = m.main.lock();
            assert!(main.holds(seed));
            (0..leases).map(|_| main.lease(&m.backend, &m.stats).unwrap()).collect()
        };
        for lease in held {
            m.run(&m.main, lease, b"x").unwrap();
        }
    }

    #[test]
    fn test_reinit_releases_old_cache_contents() {
        let m = RxCacheManager::new(PinningBackend::default(), 4);
        for (round, leases) in [4usize, 3, 2, 1].into_iter().enumerate() {
            let seed = s(round as u8 + 1);
            m.set_main_seed(&seed).unwrap();
            hash_with_leases(&m, &seed, leases);
            assert_eq!(m.backend().live_contents(), 1, "round {round}");
        }
        assert_eq!(m.main_info().idle_vms, 4);
        assert_eq!(m.stats().vm_creates, 4);
        assert_eq!(m.hash(&s(4), b"x").unwrap(), expected(&s(4), b"x"));
    }

    #[test]
    fn test_vm_leased_across_reinit_is_not_parked() {
        let m = RxCacheManager::new(PinningBackend::default(), 4);
        m.set_main_seed(&s(1)).unwrap();
        let lease = m.main.lock().lease(&m.backend, &m.stats).unwrap();

        m.set_main_seed(&s(2)).unwrap();
        // The outstanding lease still holds seed 1.
        assert_eq!(m.backend().live_contents(), 2);

        assert_eq!(m.run(&m.main, lease, b"x").unwrap(), expected(&s(1), b"x"));
        assert_eq!(m.main_info().idle_vms, 0);
        assert_eq!(m.backend().live_contents(), 1);
    }

    #[test]
    fn test_idle_pool_is_bounded() {
        let m = Arc::new(RxCacheManager::new(MockBackend::default(), 2));
        m.set_main_seed(&s(1)).unwrap();

        // Hold leases from several threads at once to force extra VMs.
        let barrier = Arc::new(std::sync::Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let m = Arc::clone(&m);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    m.hash(&s(1), &[i as u8]).unwrap()
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), expected(&s(1), &[i as u8]));
        }
        assert!(m.main_info().idle_vms <= 2);
    }
}
