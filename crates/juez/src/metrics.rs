//! Prometheus metrics for the judge

use std::sync::{LazyLock, Once};

use juez_common::Verdict;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Grading duration histogram, compile and run included
pub static ATTEMPT_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "juez_attempt_duration_seconds",
        "Time spent grading submissions",
    )
    .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]);

    HistogramVec::new(opts, &["exercise"]).expect("Failed to create histogram")
});

/// Peak memory histogram
pub static MEMORY_USAGE: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new("juez_memory_usage_bytes", "Peak memory used by submissions")
        .buckets(vec![
            1024.0 * 1024.0,         // 1 MB
            16.0 * 1024.0 * 1024.0,  // 16 MB
            64.0 * 1024.0 * 1024.0,  // 64 MB
            128.0 * 1024.0 * 1024.0, // 128 MB
            256.0 * 1024.0 * 1024.0, // 256 MB
            512.0 * 1024.0 * 1024.0, // 512 MB
        ]);

    HistogramVec::new(opts, &["exercise"]).expect("Failed to create histogram")
});

/// Verdict counter by type
pub static VERDICT_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("juez_verdict_total", "Total verdicts by type");
    IntCounterVec::new(opts, &["verdict"]).expect("Failed to create counter")
});

/// Attempts currently compiling or running
pub static ACTIVE_ATTEMPTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("juez_active_attempts", "Currently active grading attempts")
        .expect("Failed to create gauge")
});

static REGISTER: Once = Once::new();

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() {
    REGISTER.call_once(|| {
        let collectors: [Box<dyn prometheus::core::Collector>; 4] = [
            Box::new(ATTEMPT_DURATION.clone()),
            Box::new(MEMORY_USAGE.clone()),
            Box::new(VERDICT_TOTAL.clone()),
            Box::new(ACTIVE_ATTEMPTS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Record a verdict
pub fn record_verdict(verdict: Verdict) {
    VERDICT_TOTAL.with_label_values(&[verdict.code()]).inc();
}

/// Record grading metrics
pub fn record_attempt(exercise: &str, duration_secs: f64, memory_bytes: u64) {
    ATTEMPT_DURATION
        .with_label_values(&[exercise])
        .observe(duration_secs);
    if memory_bytes > 0 {
        MEMORY_USAGE
            .with_label_values(&[exercise])
            .observe(memory_bytes as f64);
    }
}

/// Keeps [`ACTIVE_ATTEMPTS`] raised while alive.
pub struct ActiveAttempt(());

impl ActiveAttempt {
    pub fn start() -> Self {
        ACTIVE_ATTEMPTS.inc();
        Self(())
    }
}

impl Drop for ActiveAttempt {
    fn drop(&mut self) {
        ACTIVE_ATTEMPTS.dec();
    }
}

/// Text exposition of every registered metric
pub fn render() -> String {
    init_metrics();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_verdicts() {
        init_metrics();
        init_metrics();
        record_verdict(Verdict::WrongAnswer);
        record_attempt("guide-1/exercise-1", 0.2, 1024 * 1024);
        let text = render();
        assert!(text.contains("juez_verdict_total"));
        assert!(text.contains("verdict=\"WA\""));
        assert!(text.contains("juez_attempt_duration_seconds"));
    }

    #[test]
    fn test_active_attempt_guard() {
        let before = ACTIVE_ATTEMPTS.get();
        {
            let _guard = ActiveAttempt::start();
            assert!(ACTIVE_ATTEMPTS.get() >= before + 1);
        }
        assert!(ACTIVE_ATTEMPTS.get() >= before);
    }
}
