//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with latency histograms sized for
//! model-backed calls and standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram,
    gauge, histogram, Unit,
};
use std::time::Instant;

/// Metrics prefix for all PropBot metrics
pub const METRICS_PREFIX: &str = "propbot";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
];

/// Buckets for collaborator latency (captioning and generation are slow)
pub const COLLABORATOR_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Chat metrics
    describe_counter!(
        format!("{}_chat_messages_total", METRICS_PREFIX),
        Unit::Count,
        "Chat messages processed, by route and outcome"
    );

    describe_histogram!(
        format!("{}_chat_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end message processing latency in seconds"
    );

    describe_counter!(
        format!("{}_detected_issues_total", METRICS_PREFIX),
        Unit::Count,
        "Property issues flagged in uploaded images"
    );

    // Session metrics
    describe_counter!(
        format!("{}_sessions_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions created"
    );

    describe_counter!(
        format!("{}_sessions_reset_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions discarded through reset"
    );

    describe_counter!(
        format!("{}_sessions_evicted_total", METRICS_PREFIX),
        Unit::Count,
        "Total sessions evicted for idleness or capacity"
    );

    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Sessions currently held in memory"
    );

    // Collaborator metrics
    describe_histogram!(
        format!("{}_collaborator_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Latency of retrieval, captioning, and generation calls"
    );

    describe_counter!(
        format!("{}_collaborator_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Failed retrieval, captioning, and generation calls"
    );

    describe_counter!(
        format!("{}_retrieval_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Text-path lookups that degraded to an empty context"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record one processed chat message
pub fn record_chat(route: &str, success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "error" };

    counter!(
        format!("{}_chat_messages_total", METRICS_PREFIX),
        "route" => route.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_chat_duration_seconds", METRICS_PREFIX),
        "route" => route.to_string()
    )
    .record(duration_secs);
}

/// Helper to record a collaborator call
pub fn record_collaborator(collaborator: &str, duration_secs: f64, success: bool) {
    histogram!(
        format!("{}_collaborator_duration_seconds", METRICS_PREFIX),
        "collaborator" => collaborator.to_string()
    )
    .record(duration_secs);

    if !success {
        counter!(
            format!("{}_collaborator_errors_total", METRICS_PREFIX),
            "collaborator" => collaborator.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a text-path lookup that fell back to no context
pub fn record_retrieval_fallback() {
    counter!(format!("{}_retrieval_fallbacks_total", METRICS_PREFIX)).increment(1);
}

/// Helper to record a flagged image issue
pub fn record_detected_issue(label: &str) {
    counter!(
        format!("{}_detected_issues_total", METRICS_PREFIX),
        "label" => label.to_string()
    )
    .increment(1);
}

/// Helper to record session lifecycle events
pub fn record_session_created() {
    counter!(format!("{}_sessions_created_total", METRICS_PREFIX)).increment(1);
}

pub fn record_session_reset() {
    counter!(format!("{}_sessions_reset_total", METRICS_PREFIX)).increment(1);
}

pub fn record_sessions_evicted(count: usize, reason: &str) {
    counter!(
        format!("{}_sessions_evicted_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

pub fn set_active_sessions(count: usize) {
    gauge!(format!("{}_sessions_active", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string(),
            "batch" => batch_size.to_string()
        )
        .record(duration_secs);
    }
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, COLLABORATOR_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }

        // Generation calls regularly take seconds
        assert!(COLLABORATOR_BUCKETS.contains(&30.00));
    }

    #[test]
    fn test_request_metrics() {
        let metrics = RequestMetrics::start("POST", "/chat");
        std::thread::sleep(std::time::Duration::from_millis(10));
        metrics.finish(200);
        // Just verify it runs without panic
    }
}
