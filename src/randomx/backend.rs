//! Light-VM backend seam.

use crate::error::PowResult;
use crate::pow::{SeedHash, U256};

/// A cache-based hash implementation: a seed-bound cache shared read-only by
/// any number of VMs, each VM owned by one caller at a time.
///
/// The manager guarantees a cache is never reinitialized while a VM is
/// hashing against it, and that a VM is rebound before use whenever the
/// cache it last saw has since been reinitialized.
pub trait RxBackend: Send + Sync + 'static {
    type Cache: Send + Sync + 'static;
    type Vm: Send + 'static;

    fn name(&self) -> &'static str;

    /// Reserve an empty cache. Fails with [`PowError::Allocation`](crate::PowError::Allocation).
    fn alloc_cache(&self) -> PowResult<Self::Cache>;

    /// (Re)fill `cache` for `seed`, discarding any previous contents.
    fn init_cache(&self, cache: &mut Self::Cache, seed: &SeedHash) -> PowResult<()>;

    fn create_vm(&self, cache: &Self::Cache) -> PowResult<Self::Vm>;

    /// Point an existing VM at `cache` after the cache was reinitialized.
    fn bind_vm(&self, vm: &mut Self::Vm, cache: &Self::Cache) -> PowResult<()>;

    /// Hash `input`. The result is the backend's raw 32-byte output.
    fn calculate_hash(&self, vm: &mut Self::Vm, cache: &Self::Cache, input: &[u8]) -> PowResult<U256>;
}
