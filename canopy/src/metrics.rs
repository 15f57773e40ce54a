//! Prometheus metrics for the analysis pipeline.
//!
//! Compiled only with the `metrics` feature.
//!
//! ## Counters
//! - `canopy_jobs_enqueued_total{queue}`
//! - `canopy_jobs_finished_total{queue,status}`
//! - `canopy_quality_skips_total{reason}`
//! - `canopy_sr_failures_total{provider,kind}`
//! - `canopy_scheduled_submissions_total`
//!
//! ## Gauges
//! - `canopy_queue_depth{queue}`: QUEUED jobs per queue
//!
//! ## Histograms
//! - `canopy_job_duration_seconds{queue,status}`
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, GaugeVec, HistogramVec, IntCounter, Opts, Registry,
    exponential_buckets,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("canopy_jobs_enqueued_total", "Analysis jobs enqueued");
    CounterVec::new(opts, &["queue"])
        .expect("canopy_jobs_enqueued_total metric creation failed")
});

pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "canopy_jobs_finished_total",
        "Analysis jobs that reached a terminal status",
    );
    CounterVec::new(opts, &["queue", "status"])
        .expect("canopy_jobs_finished_total metric creation failed")
});

pub static QUALITY_SKIPS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "canopy_quality_skips_total",
        "Scenes rejected by the quality gate",
    );
    CounterVec::new(opts, &["reason"])
        .expect("canopy_quality_skips_total metric creation failed")
});

pub static SR_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "canopy_sr_failures_total",
        "Super-resolution provider failures",
    );
    CounterVec::new(opts, &["provider", "kind"])
        .expect("canopy_sr_failures_total metric creation failed")
});

pub static SCHEDULED_SUBMISSIONS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| {
        IntCounter::new(
            "canopy_scheduled_submissions_total",
            "Analyses submitted by the cadence scheduler",
        )
        .expect("canopy_scheduled_submissions_total metric creation failed")
    });

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("canopy_queue_depth", "QUEUED jobs per queue");
    GaugeVec::new(opts, &["queue"])
        .expect("canopy_queue_depth metric creation failed")
});

/// Claim-to-completion time. Buckets run from 50ms to roughly 30 minutes
/// to cover SR jobs.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets =
        exponential_buckets(0.05, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "canopy_job_duration_seconds",
        "Analysis job duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "status"])
        .expect("canopy_job_duration_seconds metric creation failed")
});

/// Registers every collector. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(QUALITY_SKIPS_TOTAL.clone()),
        Box::new(SR_FAILURES_TOTAL.clone()),
        Box::new(SCHEDULED_SUBMISSIONS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_job_finished(queue: &str, status: &str, duration_secs: f64) {
    JOBS_FINISHED_TOTAL.with_label_values(&[queue, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, status])
        .observe(duration_secs);
}

pub fn record_quality_skip(reason: &str) {
    QUALITY_SKIPS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_sr_failure(provider: &str, kind: &str) {
    SR_FAILURES_TOTAL.with_label_values(&[provider, kind]).inc();
}

pub fn record_scheduled_submissions(count: u64) {
    SCHEDULED_SUBMISSIONS_TOTAL.inc_by(count);
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

/// All registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
