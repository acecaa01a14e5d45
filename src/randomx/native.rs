//! RandomX light mode through `randomx-rs`.

use randomx_rs::{RandomXCache, RandomXFlag, RandomXVM};
use tracing::{debug, warn};

use super::backend::RxBackend;
use crate::error::{PowError, PowResult};
use crate::pow::{SeedHash, U256};

/// RandomX cache size in light mode.
const RANDOMX_CACHE_BYTES: u64 = 256 * 1024 * 1024;

pub struct NativeCache {
    inner: Option<RandomXCache>,
}

// SAFETY: a RandomX cache is only written by `randomx_init_cache`, which the
// manager calls with exclusive access. VMs read it concurrently afterwards.
unsafe impl Send for NativeCache {}
unsafe impl Sync for NativeCache {}

pub struct NativeVm {
    vm: RandomXVM,
}

// SAFETY: a VM is used by one thread at a time; the manager hands it out by
// value and never shares it.
unsafe impl Send for NativeVm {}

#[derive(Debug, Clone, Copy)]
pub struct NativeBackend {
    flags: RandomXFlag,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            flags: RandomXFlag::get_recommended_flags(),
        }
    }

    fn new_cache(&self, key: &[u8]) -> PowResult<RandomXCache> {
        RandomXCache::new(self.flags, key).map_err(|e| {
            warn!(target: "hybrid_pow::randomx", error = %e, "randomx cache allocation failed");
            PowError::allocation("randomx cache", RANDOMX_CACHE_BYTES)
        })
    }
}

impl RxBackend for NativeBackend {
    type Cache = NativeCache;
    type Vm = NativeVm;

    fn name(&self) -> &'static str {
        "native"
    }

    /// `randomx-rs` allocates and initializes in one call, so the buffer is
    /// created by [`init_cache`](RxBackend::init_cache).
    fn alloc_cache(&self) -> PowResult<NativeCache> {
        Ok(NativeCache { inner: None })
    }

    fn init_cache(&self, cache: &mut NativeCache, seed: &SeedHash) -> PowResult<()> {
        cache.inner = None;
        cache.inner = Some(self.new_cache(seed.as_bytes())?);
        Ok(())
    }

    fn create_vm(&self, cache: &NativeCache) -> PowResult<NativeVm> {
        let inner = cache
            .inner
            .clone()
            .ok_or(PowError::UninitializedState("randomx cache not initialized"))?;
        let vm = RandomXVM::new(self.flags, Some(inner), None)
            .map_err(|e| PowError::Backend(e.to_string()))?;
        debug!(target: "hybrid_pow::randomx", "randomx vm created");
        Ok(NativeVm { vm })
    }

    fn bind_vm(&self, vm: &mut NativeVm, cache: &NativeCache) -> PowResult<()> {
        let inner = cache
            .inner
            .clone()
            .ok_or(PowError::UninitializedState("randomx cache not initialized"))?;
        vm.vm
            .reinit_cache(inner)
            .map_err(|e| PowError::Backend(e.to_string()))
    }

    fn calculate_hash(&self, vm: &mut NativeVm, _cache: &NativeCache, input: &[u8]) -> PowResult<U256> {
        let out = vm
            .vm
            .calculate_hash(input)
            .map_err(|e| PowError::Backend(e.to_string()))?;
        out.as_slice()
            .try_into()
            .map_err(|_| PowError::Backend(format!("randomx returned {} bytes", out.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        let backend = NativeBackend::new();
        let cache = NativeCache {
            inner: Some(backend.new_cache(b"test key 000").unwrap()),
        };
        let mut vm = backend.create_vm(&cache).unwrap();
        let out = backend.calculate_hash(&mut vm, &cache, b"This is a test").unwrap();
        assert_eq!(
            hex::encode(out),
            "639183aae1bf4c9a35884cb46b09cad9175f04efd7684e7262a0ac1c2f0b4e3f"
        );
    }

    #[test]
    fn test_rebind_after_reinit() {
        let backend = NativeBackend::new();
        let mut cache = backend.alloc_cache().unwrap();
        backend.init_cache(&mut cache, &SeedHash::ZERO).unwrap();
        let mut vm = backend.create_vm(&cache).unwrap();
        let a = backend.calculate_hash(&mut vm, &cache, b"x").unwrap();

        backend.init_cache(&mut cache, &SeedHash::new([1; 32])).unwrap();
        backend.bind_vm(&mut vm, &cache).unwrap();
        let b = backend.calculate_hash(&mut vm, &cache, b"x").unwrap();
        assert_ne!(a, b);
    }
}
