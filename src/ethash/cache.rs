//! Epoch-keyed context cache with at-most-one build per epoch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::context::{ContextOptions, EpochContext};
use super::hasher::{Hash512Fn, Keccak512Fn};
use super::sizing::EpochParams;
use crate::error::PowResult;
use crate::metrics;
use crate::pow::seed::SeedChain;

type Slot = Arc<OnceCell<Arc<EpochContext>>>;

#[derive(Debug, Default)]
struct EpochStats {
    builds: AtomicU64,
    failed_builds: AtomicU64,
    retired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EpochStatsSnapshot {
    pub builds: u64,
    pub failed_builds: u64,
    pub retired: u64,
}

/// Lazily builds and keeps the most recent epoch contexts.
///
/// Concurrent requests for the same epoch share one build: the first caller
/// builds while the rest block on the same cell. A failed build leaves no
/// entry behind, so the next request starts from scratch.
pub struct EpochContextCache<H: Hash512Fn = Keccak512Fn> {
    params: EpochParams,
    hasher: H,
    want_full: bool,
    want_l1: bool,
    retained_epochs: usize,
    /// 0 = unlimited.
    memory_limit: AtomicU64,
    seeds: SeedChain,
    slots: DashMap<u64, Slot>,
    recent: Mutex<VecDeque<u64>>,
    stats: EpochStats,
}

impl EpochContextCache<Keccak512Fn> {
    pub fn new(params: EpochParams, want_full: bool, retained_epochs: usize) -> Self {
        Self::with_hasher(params, Keccak512Fn, want_full, retained_epochs)
    }
}

impl<H: Hash512Fn> EpochContextCache<H> {
    pub fn with_hasher(params: EpochParams, hasher: H, want_full: bool, retained_epochs: usize) -> Self {
        Self {
            params,
            hasher,
            want_full,
            want_l1: false,
            retained_epochs: retained_epochs.max(1),
            memory_limit: AtomicU64::new(0),
            seeds: SeedChain::new(),
            slots: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
            stats: EpochStats::default(),
        }
    }

    /// Also build the L1 dataset mirror for every context.
    pub fn with_l1_cache(mut self, on: bool) -> Self {
        self.want_l1 = on;
        self
    }

    pub fn params(&self) -> &EpochParams {
        &self.params
    }

    pub fn seeds(&self) -> &SeedChain {
        &self.seeds
    }

    pub fn want_full(&self) -> bool {
        self.want_full
    }

    /// Cap on the bytes of any single context built from now on.
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        self.memory_limit.store(limit.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn memory_limit(&self) -> Option<u64> {
        match self.memory_limit.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn get_for_height(&self, height: u64) -> PowResult<Arc<EpochContext>> {
        self.get(self.params.epoch_number(height))
    }

    pub fn get(&self, epoch: u64) -> PowResult<Arc<EpochContext>> {
        let slot: Slot = self.slots.entry(epoch).or_default().clone();

        let result = slot.get_or_try_init(|| self.build(epoch)).map(Arc::clone);
        match result {
            Ok(ctx) => {
                self.touch(epoch);
                Ok(ctx)
            }
            Err(e) => {
                self.slots.remove_if(&epoch, |_, s| Arc::ptr_eq(s, &slot));
                Err(e)
            }
        }
    }

    fn build(&self, epoch: u64) -> PowResult<Arc<EpochContext>> {
        let started = Instant::now();
        let opts = ContextOptions {
            full_dataset: self.want_full,
            l1_cache: self.want_l1,
            memory_limit: self.memory_limit(),
        };
        // The seed chain is only extended for a build that has its memory.
        let built = EpochContext::build_with(
            &self.params,
            &self.hasher,
            epoch,
            || self.seeds.seed(epoch),
            opts,
        );
        match built {
            Ok(ctx) => {
                let elapsed = started.elapsed();
                self.stats.builds.fetch_add(1, Ordering::Relaxed);
                metrics::EPOCH_BUILDS.inc();
                metrics::EPOCH_BUILD_SECONDS.observe(elapsed.as_secs_f64());
                info!(
                    target: "hybrid_pow::ethash",
                    epoch,
                    full = self.want_full,
                    bytes = ctx.memory_bytes(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "epoch context built"
                );
                Ok(Arc::new(ctx))
            }
            Err(e) => {
                self.stats.failed_builds.fetch_add(1, Ordering::Relaxed);
                metrics::EPOCH_BUILD_FAILURES.inc();
                warn!(target: "hybrid_pow::ethash", epoch, error = %e, "epoch context build failed");
                Err(e)
            }
        }
    }

    /// Mark `epoch` most recently used and retire the oldest beyond the
    /// retention window. Retired contexts stay alive for holders of an `Arc`.
    fn touch(&self, epoch: u64) {
        let mut recent = self.recent.lock();
        if let Some(pos) = recent.iter().position(|&e| e == epoch) {
            recent.remove(pos);
        }
        recent.push_back(epoch);
        while recent.len() > self.retained_epochs {
            if let Some(old) = recent.pop_front() {
                self.slots.remove(&old);
                self.stats.retired.fetch_add(1, Ordering::Relaxed);
                debug!(target: "hybrid_pow::ethash", epoch = old, "epoch context retired");
            }
        }
    }

    /// A built context for `epoch` is cached.
    pub fn contains(&self, epoch: u64) -> bool {
        self.slots
            .get(&epoch)
            .map(|s| s.get().is_some())
            .unwrap_or(false)
    }

    /// Epochs with a built context, oldest first.
    pub fn cached_epochs(&self) -> Vec<u64> {
        self.recent
            .lock()
            .iter()
            .copied()
            .filter(|e| self.contains(*e))
            .collect()
    }

    pub fn stats(&self) -> EpochStatsSnapshot {
        EpochStatsSnapshot {
            builds: self.stats.builds.load(Ordering::Relaxed),
            failed_builds: self.stats.failed_builds.load(Ordering::Relaxed),
            retired: self.stats.retired.load(Ordering::Relaxed),
        }
    }
}
