//! Upstream client and reconciliation metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! binary installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Client Metrics
// ============================================================================

/// Upstream request duration histogram.
pub const UPSTREAM_REQUEST_DURATION: &str = "outpost_upstream_request_duration_seconds";

/// Upstream requests counter.
pub const UPSTREAM_REQUESTS: &str = "outpost_upstream_requests_total";

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Rows pushed by reconciliation or the push queue.
pub const ROWS_PUSHED: &str = "outpost_rows_pushed_total";

/// Reconciliation pages whose hashes already matched.
pub const RECONCILE_PAGES_SKIPPED: &str = "outpost_reconcile_pages_skipped_total";

/// Registers all upstream metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_histogram!(
        UPSTREAM_REQUEST_DURATION,
        "Duration of upstream HTTP requests in seconds"
    );
    describe_counter!(UPSTREAM_REQUESTS, "Total upstream HTTP requests");
    describe_counter!(ROWS_PUSHED, "Total rows acknowledged by upstream");
    describe_counter!(
        RECONCILE_PAGES_SKIPPED,
        "Total reconciliation pages skipped because hashes matched"
    );
}

/// Records one upstream request.
pub fn record_request(agent: &str, method: &str, outcome: &str, duration_secs: f64) {
    let labels = [
        ("agent", agent.to_string()),
        ("method", method.to_string()),
        ("outcome", outcome.to_string()),
    ];

    counter!(UPSTREAM_REQUESTS, &labels).increment(1);
    histogram!(UPSTREAM_REQUEST_DURATION, &labels).record(duration_secs);
}

pub fn record_rows_pushed(table: &str, rows: u64) {
    counter!(ROWS_PUSHED, "table" => table.to_string()).increment(rows);
}

pub fn record_page_skipped(table: &str) {
    counter!(RECONCILE_PAGES_SKIPPED, "table" => table.to_string()).increment(1);
}
