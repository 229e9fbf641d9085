//! Prometheus Metrics Module
//!
//! Provides application-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - HTTP request counts and latency
//! - Live WebSocket connections and registry sessions
//! - Inbound chat messages by type, client errors by code
//! - Rate limit rejections by limiter
//! - Admin takeover outcomes
//! - LLM turn latency

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "chatbox";

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// HTTP request counter - tracks total requests by method, path, and status code
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests").namespace(NAMESPACE),
        &["method", "path", "status"],
    )
    .expect("Failed to create HTTP_REQUESTS_TOTAL metric")
});

/// HTTP request latency histogram - tracks request duration in seconds
pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
    HistogramVec::new(
        HistogramOpts::new("http_request_duration_seconds", "HTTP request latency in seconds")
            .namespace(NAMESPACE)
            .buckets(buckets),
        &["method", "path"],
    )
    .expect("Failed to create HTTP_REQUEST_DURATION_SECONDS metric")
});

/// Live WebSocket connections
pub static WEBSOCKET_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("websocket_connections_active", "Number of live WebSocket connections")
            .namespace(NAMESPACE),
    )
    .expect("Failed to create WEBSOCKET_CONNECTIONS_ACTIVE metric")
});

/// Sessions held by the registry
pub static SESSIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("sessions", "Sessions held in memory").namespace(NAMESPACE),
        &["state"], // "active", "inactive"
    )
    .expect("Failed to create SESSIONS metric")
});

/// Inbound chat messages by type
pub static MESSAGES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("messages_received_total", "Inbound chat messages").namespace(NAMESPACE),
        &["type"],
    )
    .expect("Failed to create MESSAGES_RECEIVED_TOTAL metric")
});

/// Error frames sent to clients by code
pub static CHAT_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("chat_errors_total", "Error frames sent to clients").namespace(NAMESPACE),
        &["code"],
    )
    .expect("Failed to create CHAT_ERRORS_TOTAL metric")
});

/// Requests rejected by a rate limiter
pub static RATE_LIMIT_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rate_limit_rejections_total", "Requests rejected by rate limiting")
            .namespace(NAMESPACE),
        &["limiter"],
    )
    .expect("Failed to create RATE_LIMIT_REJECTIONS_TOTAL metric")
});

/// Admin takeover attempts by outcome
pub static ADMIN_TAKEOVERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("admin_takeovers_total", "Admin takeover attempts").namespace(NAMESPACE),
        &["outcome"], // "success", "conflict", "not_found"
    )
    .expect("Failed to create ADMIN_TAKEOVERS_TOTAL metric")
});

/// LLM turn latency
pub static LLM_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];
    HistogramVec::new(
        HistogramOpts::new("llm_request_duration_seconds", "LLM turn latency in seconds")
            .namespace(NAMESPACE)
            .buckets(buckets),
        &["outcome"], // "success", "error", "timeout", "cancelled"
    )
    .expect("Failed to create LLM_REQUEST_DURATION_SECONDS metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("Failed to register HTTP_REQUESTS_TOTAL");
    registry
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register WEBSOCKET_CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(SESSIONS.clone()))
        .expect("Failed to register SESSIONS");
    registry
        .register(Box::new(MESSAGES_RECEIVED_TOTAL.clone()))
        .expect("Failed to register MESSAGES_RECEIVED_TOTAL");
    registry
        .register(Box::new(CHAT_ERRORS_TOTAL.clone()))
        .expect("Failed to register CHAT_ERRORS_TOTAL");
    registry
        .register(Box::new(RATE_LIMIT_REJECTIONS_TOTAL.clone()))
        .expect("Failed to register RATE_LIMIT_REJECTIONS_TOTAL");
    registry
        .register(Box::new(ADMIN_TAKEOVERS_TOTAL.clone()))
        .expect("Failed to register ADMIN_TAKEOVERS_TOTAL");
    registry
        .register(Box::new(LLM_REQUEST_DURATION_SECONDS.clone()))
        .expect("Failed to register LLM_REQUEST_DURATION_SECONDS");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to record HTTP request metrics
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

/// Helper to update the live connection gauge
pub fn set_websocket_connections(count: usize) {
    WEBSOCKET_CONNECTIONS_ACTIVE.set(count as i64);
}

/// Helper to update session gauges
pub fn set_sessions(active: usize, inactive: usize) {
    SESSIONS.with_label_values(&["active"]).set(active as i64);
    SESSIONS.with_label_values(&["inactive"]).set(inactive as i64);
}

pub fn record_message_received(message_type: &str) {
    MESSAGES_RECEIVED_TOTAL.with_label_values(&[message_type]).inc();
}

pub fn record_chat_error(code: &str) {
    CHAT_ERRORS_TOTAL.with_label_values(&[code]).inc();
}

pub fn record_rate_limit_rejection(limiter: &str) {
    RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&[limiter]).inc();
}

pub fn record_admin_takeover(outcome: &str) {
    ADMIN_TAKEOVERS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_llm_request(outcome: &str, duration_secs: f64) {
    LLM_REQUEST_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}
