use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Store Metrics
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "store_operations_total",
        "Total number of session store operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "store_operation_duration_seconds",
        "Session store operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Business Metrics
    pub static ref EXAM_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "exam_sessions_total",
        "Exam sessions by lifecycle outcome",
        &["status"]
    )
    .unwrap();

    pub static ref EXAM_SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        "exam_sessions_active",
        "Number of exam sessions started but not yet finished or cancelled"
    )
    .unwrap();

    pub static ref ANSWERS_SUBMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "answers_submitted_total",
        "Total number of final answers accepted",
        &["correct"]
    )
    .unwrap();

    pub static ref DUPLICATE_SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "duplicate_submissions_total",
        "Final answers rejected because the question was already answered",
        &["reason"]
    )
    .unwrap();

    pub static ref DRAFT_AUTOSAVES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "draft_autosaves_total",
        "Draft autosaves by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref LIFECYCLE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lifecycle_transitions_total",
        "Session status transitions by outcome",
        &["from", "to", "outcome"]
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();

    pub static ref EXPIRY_WORKER_TICKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "expiry_worker_ticks_total",
        "Total number of expiry worker ticks",
        &["status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track store operation with metrics
pub async fn track_store_operation<F, T>(
    operation: &str,
    collection: &str,
    future: F,
) -> Result<T, anyhow::Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    STORE_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    STORE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

pub fn record_transition(from: &str, to: &str, outcome: &str) {
    LIFECYCLE_TRANSITIONS_TOTAL
        .with_label_values(&[from, to, outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/health", "200"])
            .get();
        let _ = LIFECYCLE_TRANSITIONS_TOTAL
            .with_label_values(&["ongoing", "finished", "applied"])
            .get();
    }

    #[test]
    fn test_render_metrics() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();
        record_transition("waiting", "starting", "applied");

        let output = render_metrics().unwrap();
        assert!(output.contains("http_requests_total"));
        assert!(output.contains("lifecycle_transitions_total"));
    }

    #[tokio::test]
    async fn store_operations_are_counted_by_status() {
        let before = STORE_OPERATIONS_TOTAL
            .with_label_values(&["probe", "unit", "error"])
            .get();
        let result: anyhow::Result<()> =
            track_store_operation("probe", "unit", async { Err(anyhow::anyhow!("down")) }).await;
        assert!(result.is_err());
        let after = STORE_OPERATIONS_TOTAL
            .with_label_values(&["probe", "unit", "error"])
            .get();
        assert_eq!(after, before + 1);
    }
}
