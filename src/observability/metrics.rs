use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

const REQUESTS_TOTAL: &str = "idempotency_requests_total";
const CAPTURES_TOTAL: &str = "idempotency_captures_total";
const REPORTED_ERRORS_TOTAL: &str = "idempotency_reported_errors_total";
const PURGED_TOTAL: &str = "idempotency_purged_resources_total";
const STORE_OPERATIONS_TOTAL: &str = "idempotency_store_operations_total";
const STORE_DURATION_MS: &str = "idempotency_store_operation_duration_ms";
const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
const HTTP_DURATION_MS: &str = "http_request_duration_ms";

/// Millisecond buckets shared by every latency histogram.
const LATENCY_BUCKETS_MS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Recorder facade for idempotency handling. Without an installed exporter
/// every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// `outcome` is one of pass_through, miss, hit, conflict, misuse, store_error.
    pub fn record_decision(&self, outcome: &str) {
        counter!(REQUESTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
    }

    /// `result` is one of persisted, discarded, failed.
    pub fn record_capture(&self, result: &str) {
        counter!(CAPTURES_TOTAL, "result" => result.to_string()).increment(1);
    }

    pub fn record_reported_error(&self) {
        counter!(REPORTED_ERRORS_TOTAL).increment(1);
    }

    pub fn record_store_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!(STORE_OPERATIONS_TOTAL, "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!(STORE_DURATION_MS, "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_purged(&self, count: u64) {
        counter!(PURGED_TOTAL).increment(count);
    }

    /// `path` should be the route template, not the raw URI.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!(HTTP_REQUESTS_TOTAL, "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!(HTTP_DURATION_MS, "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("duration_ms".to_string()), LATENCY_BUCKETS_MS)?
        .install_recorder()?;
    describe_metrics();

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Requests by idempotency decision");
    describe_counter!(CAPTURES_TOTAL, Unit::Count, "Captured responses by persistence result");
    describe_counter!(REPORTED_ERRORS_TOTAL, Unit::Count, "Downstream failures reported for keyed requests");
    describe_counter!(PURGED_TOTAL, Unit::Count, "Expired resources removed by the cleanup job");
    describe_counter!(STORE_OPERATIONS_TOTAL, Unit::Count, "Resource store operations");
    describe_histogram!(STORE_DURATION_MS, Unit::Milliseconds, "Resource store latency");
    describe_counter!(HTTP_REQUESTS_TOTAL, Unit::Count, "HTTP requests through the idempotency layer");
    describe_histogram!(HTTP_DURATION_MS, Unit::Milliseconds, "HTTP latency through the idempotency layer");
}

pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
