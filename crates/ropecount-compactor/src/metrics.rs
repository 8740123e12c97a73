//! Compactor metrics.
//!
//! Prometheus-exposed counters and histograms for the compaction hot
//! path: members merged, claim races lost, request durations.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use ropecount_core::Direction;

/// Members merged into the sink.
pub const MEMBERS_COMPACTED: &str = "compactor_members_compacted_total";

/// Claims lost to a concurrent worker.
pub const CLAIM_RACES: &str = "compactor_claim_races_total";

/// Process requests that returned an error.
pub const PROCESS_ERRORS: &str = "compactor_process_errors_total";

/// End-to-end duration of process requests in seconds.
pub const PROCESS_DURATION: &str = "compactor_process_duration_seconds";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the global metrics recorder with a Prometheus exporter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the recorder cannot be installed; the service should not
/// start without its metrics.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_counter!(MEMBERS_COMPACTED, "Members merged into the durable sink");
            describe_counter!(CLAIM_RACES, "Claims lost to a concurrent worker");
            describe_counter!(PROCESS_ERRORS, "Process requests that returned an error");
            describe_histogram!(
                PROCESS_DURATION,
                "End-to-end duration of process requests in seconds"
            );

            handle
        })
        .clone()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records one successfully merged member.
pub fn record_member_compacted(direction: Direction) {
    counter!(MEMBERS_COMPACTED, "direction" => direction.as_str()).increment(1);
}

/// Records a claim lost to another worker.
pub fn record_claim_race() {
    counter!(CLAIM_RACES).increment(1);
}

/// Records a finished process request.
pub fn record_process(duration_secs: f64, ok: bool) {
    histogram!(PROCESS_DURATION).record(duration_secs);
    if !ok {
        counter!(PROCESS_ERRORS).increment(1);
    }
}
