//! Prometheus metrics for the scoring engine.
//!
//! Collectors register themselves with the default registry on first use and
//! are rendered by the `/metrics` handler.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    TextEncoder,
};
use std::time::Duration;

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "recommendation_requests_total",
            "Recommendation requests by final status",
        ),
        &["status"],
    )
    .expect("failed to create recommendation_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_requests_total");
    counter
});

static REQUEST_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "recommendation_request_duration_seconds",
            "End-to-end latency of recommendation requests",
        )
        .buckets(vec![
            0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.08, 0.1, 0.25, 0.5,
        ]),
    )
    .expect("failed to create recommendation_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register recommendation_request_duration_seconds");
    histogram
});

static STRATEGY_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "recommendation_strategy_outcomes_total",
            "Per-request strategy outcomes",
        ),
        &["strategy", "outcome"],
    )
    .expect("failed to create recommendation_strategy_outcomes_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_strategy_outcomes_total");
    counter
});

static STRATEGY_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "recommendation_strategy_duration_seconds",
            "Time spent in each scoring strategy",
        )
        .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
        &["strategy"],
    )
    .expect("failed to create recommendation_strategy_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register recommendation_strategy_duration_seconds");
    histogram
});

static FEATURE_CACHE_LOOKUPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "recommendation_feature_cache_lookups_total",
            "Feature cache lookups by result",
        ),
        &["result"],
    )
    .expect("failed to create recommendation_feature_cache_lookups_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_feature_cache_lookups_total");
    counter
});

static FEATURE_UPSTREAM_FETCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "recommendation_feature_upstream_fetches_total",
            "Attribute store fetches issued by the feature cache",
        ),
        &["result"],
    )
    .expect("failed to create recommendation_feature_upstream_fetches_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_feature_upstream_fetches_total");
    counter
});

static ARTIFACT_RELOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "recommendation_artifact_reloads_total",
            "Artifact reload attempts by kind and result",
        ),
        &["kind", "result"],
    )
    .expect("failed to create recommendation_artifact_reloads_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_artifact_reloads_total");
    counter
});

static ARTIFACT_ACTIVE_VERSION: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "recommendation_artifact_active_version",
            "Version of the artifact currently served",
        ),
        &["kind"],
    )
    .expect("failed to create recommendation_artifact_active_version");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register recommendation_artifact_active_version");
    gauge
});

static COLD_CANDIDATES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "recommendation_cold_candidates_total",
        "Candidates ranked with cold-start fallback strategies only",
    )
    .expect("failed to create recommendation_cold_candidates_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_cold_candidates_total");
    counter
});

static OUTCOME_RECORDS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "recommendation_outcome_records_dropped_total",
        "Outcome records dropped because the analytics channel was full",
    )
    .expect("failed to create recommendation_outcome_records_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register recommendation_outcome_records_dropped_total");
    counter
});

pub fn record_request(status: &str, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[status]).inc();
    REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_strategy(strategy: &str, outcome: &str, elapsed: Duration) {
    STRATEGY_OUTCOMES_TOTAL
        .with_label_values(&[strategy, outcome])
        .inc();
    STRATEGY_DURATION_SECONDS
        .with_label_values(&[strategy])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    FEATURE_CACHE_LOOKUPS_TOTAL
        .with_label_values(&[result])
        .inc();
}

pub fn record_upstream_fetch(result: &str) {
    FEATURE_UPSTREAM_FETCHES_TOTAL
        .with_label_values(&[result])
        .inc();
}

pub fn record_artifact_reload(kind: &str, result: &str) {
    ARTIFACT_RELOADS_TOTAL
        .with_label_values(&[kind, result])
        .inc();
}

pub fn set_artifact_version(kind: &str, version: u64) {
    ARTIFACT_ACTIVE_VERSION
        .with_label_values(&[kind])
        .set(i64::try_from(version).unwrap_or(i64::MAX));
}

pub fn record_cold_candidates(count: usize) {
    COLD_CANDIDATES_TOTAL.inc_by(count as u64);
}

pub fn record_outcome_dropped() {
    OUTCOME_RECORDS_DROPPED_TOTAL.inc();
}

/// Render every registered collector in the Prometheus text format.
pub fn render() -> Result<(String, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;

    let body = String::from_utf8_lossy(&buffer).into_owned();
    Ok((encoder.format_type().to_string(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_request("complete", Duration::from_millis(3));
        record_strategy("popularity", "complete", Duration::from_micros(200));

        let (content_type, body) = render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("recommendation_requests_total"));
        assert!(body.contains("recommendation_strategy_outcomes_total"));
    }
}
