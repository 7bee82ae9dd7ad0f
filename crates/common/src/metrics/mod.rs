//! Metrics and observability utilities
//!
//! Prometheus metrics for the answer pipeline. Chat latency is dominated by
//! upstream model calls, so buckets are in seconds rather than milliseconds.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all Scholarbot metrics
pub const METRICS_PREFIX: &str = "scholarbot";

/// Histogram buckets for end-to-end chat latency (in seconds)
pub const CHAT_BUCKETS: &[f64] = &[
    0.250, 0.500, 1.000, 2.000, 3.000, 5.000, 7.500, 10.00, 15.00, 30.00, 60.00,
];

/// Buckets for embedding and index latency
pub const RETRIEVAL_BUCKETS: &[f64] = &[
    0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000, 10.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_chat_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total chat requests by mode and routed intent"
    );

    describe_counter!(
        format!("{}_chat_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Chat requests that ended in an error"
    );

    describe_histogram!(
        format!("{}_chat_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end chat latency in seconds"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Filter extraction, embedding and search latency"
    );

    describe_gauge!(
        format!("{}_retrieval_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of chunks returned by the last search"
    );

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

    describe_counter!(
        format!("{}_llm_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "Tokens reported by the answer model"
    );

    describe_counter!(
        format!("{}_filter_extraction_total", METRICS_PREFIX),
        Unit::Count,
        "Metadata filter extraction outcomes"
    );

    describe_counter!(
        format!("{}_qa_log_writes_total", METRICS_PREFIX),
        Unit::Count,
        "QA audit log writes"
    );

    describe_counter!(
        format!("{}_feedback_total", METRICS_PREFIX),
        Unit::Count,
        "Feedback submissions by type"
    );

    tracing::info!("Metrics registered");
}

/// Record a finished chat request
pub fn record_chat(duration_secs: f64, mode: &str, intent: &str, success: bool) {
    counter!(
        format!("{}_chat_requests_total", METRICS_PREFIX),
        "mode" => mode.to_string(),
        "intent" => intent.to_string()
    )
    .increment(1);

    if !success {
        counter!(
            format!("{}_chat_errors_total", METRICS_PREFIX),
            "mode" => mode.to_string()
        )
        .increment(1);
    }

    histogram!(
        format!("{}_chat_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);
}

/// Record a retrieval pass
pub fn record_retrieval(duration_secs: f64, result_count: usize, filtered: bool) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "filtered" => filtered.to_string()
    )
    .record(duration_secs);

    gauge!(format!("{}_retrieval_results_count", METRICS_PREFIX)).set(result_count as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record token usage reported by the model
pub fn record_tokens(prompt: u32, completion: u32) {
    counter!(format!("{}_llm_tokens_total", METRICS_PREFIX), "kind" => "prompt")
        .increment(u64::from(prompt));
    counter!(format!("{}_llm_tokens_total", METRICS_PREFIX), "kind" => "completion")
        .increment(u64::from(completion));
}

/// Outcome is one of `applied`, `empty`, `failed`
pub fn record_filter_extraction(outcome: &'static str) {
    counter!(
        format!("{}_filter_extraction_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_log_write(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_qa_log_writes_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);
}

pub fn record_feedback(feedback_type: &str) {
    counter!(
        format!("{}_feedback_total", METRICS_PREFIX),
        "type" => feedback_type.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [CHAT_BUCKETS, RETRIEVAL_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }

        // Streaming answers regularly take several seconds
        assert!(CHAT_BUCKETS.contains(&5.000));
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls are no-ops and must not panic
        record_chat(1.2, "stream", "scholarship", true);
        record_retrieval(0.3, 7, false);
        record_tokens(120, 40);
        record_filter_extraction("empty");
        record_log_write(false);
        record_feedback("like");
    }
}
