//! Prometheus metrics for the PoW engines.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C>(collector: C) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    // ignore error if already registered
    let _ = REGISTRY.register(Box::new(collector.clone()));
    collector
}

pub static RX_HASHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("hybrid_pow_randomx_hashes_total", "Light-VM hashes by path"),
            &["path"],
        )
        .expect("create counter"),
    )
});

pub static RX_CACHE_INITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "hybrid_pow_randomx_cache_inits_total",
                "Light-VM cache initializations by generation",
            ),
            &["generation"],
        )
        .expect("create counter"),
    )
});

pub static EPOCH_BUILDS: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("hybrid_pow_epoch_builds_total", "Ethash epoch contexts built")
            .expect("create counter"),
    )
});

pub static EPOCH_BUILD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "hybrid_pow_epoch_build_failures_total",
            "Ethash epoch context builds that failed",
        )
        .expect("create counter"),
    )
});

pub static EPOCH_BUILD_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "hybrid_pow_epoch_build_seconds",
        "Ethash epoch context build duration seconds",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]);
    register(Histogram::with_opts(opts).expect("create histogram"))
});

/// Prometheus text exposition of every metric above.
pub fn gather_text() -> String {
    Lazy::force(&RX_HASHES);
    Lazy::force(&RX_CACHE_INITS);
    Lazy::force(&EPOCH_BUILDS);
    Lazy::force(&EPOCH_BUILD_FAILURES);
    Lazy::force(&EPOCH_BUILD_SECONDS);

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_lists_metrics() {
        EPOCH_BUILDS.inc();
        RX_HASHES.with_label_values(&["fast"]).inc();
        let text = gather_text();
        assert!(text.contains("hybrid_pow_epoch_builds_total"));
        assert!(text.contains("hybrid_pow_randomx_hashes_total{path=\"fast\"}"));
        assert!(text.contains("hybrid_pow_epoch_build_seconds_bucket"));
    }
}
