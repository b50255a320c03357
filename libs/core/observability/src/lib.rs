//! Observability utilities for the control plane.
//!
//! This crate provides:
//! - Prometheus metrics recording and export
//! - Axum middleware for automatic request metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use observability::{init_metrics, metrics_handler};
//!
//! // Initialize metrics recorder
//! init_metrics();
//!
//! // Add metrics endpoint to router
//! let app = Router::new()
//!     .route("/metrics", get(metrics_handler));
//! ```

pub mod middleware;

pub use middleware::MetricsLayer;

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the Prometheus metrics recorder.
///
/// This should be called once at application startup.
/// Returns the PrometheusHandle for rendering metrics.
pub fn init_metrics() -> &'static PrometheusHandle {
    METRICS_HANDLE.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        info!("Prometheus metrics recorder initialized");

        // Register metric descriptions
        register_metric_descriptions();

        handle
    })
}

/// Get the metrics handle (must call init_metrics first)
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

/// Axum handler for /metrics endpoint
pub async fn metrics_handler() -> String {
    match get_metrics_handle() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

/// Register metric descriptions for documentation
fn register_metric_descriptions() {
    use metrics::describe_counter;
    use metrics::describe_gauge;
    use metrics::describe_histogram;

    // HTTP metrics
    describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "http_requests_errors_total",
        "Total number of HTTP request errors"
    );

    // Cloud control plane metrics
    describe_counter!(
        "cloud_control_accrued_cost_cents_total",
        "Total cost accrued across monitor cost-accrual passes, in cents"
    );
    describe_counter!(
        "cloud_control_event_bus_drops_total",
        "Total events dropped because a subscriber's channel was full"
    );
}
