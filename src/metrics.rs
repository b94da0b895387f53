//! Prometheus metrics for the SEMILLA bridge engine
//!
//! Exposed on /metrics for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Gauge, HistogramVec,
};

lazy_static! {
    // Request outcomes
    pub static ref BRIDGE_REQUESTS: CounterVec = register_counter_vec!(
        "bridge_requests_total",
        "Total number of bridge requests",
        &["direction", "outcome"]
    ).unwrap();

    pub static ref REJECTIONS: CounterVec = register_counter_vec!(
        "bridge_rejections_total",
        "Total number of rejected bridge requests",
        &["code"]
    ).unwrap();

    // Circuit breaker
    pub static ref BREAKER_OPEN: Gauge = register_gauge!(
        "bridge_circuit_breaker_open",
        "Whether the circuit breaker is open (1) or closed (0)"
    ).unwrap();

    pub static ref BREAKER_TRIPS: CounterVec = register_counter_vec!(
        "bridge_circuit_breaker_trips_total",
        "Total number of circuit breaker activations",
        &["mode"]
    ).unwrap();

    // Security events
    pub static ref SECURITY_EVENTS: CounterVec = register_counter_vec!(
        "bridge_security_events_total",
        "Total number of security events recorded",
        &["severity", "type"]
    ).unwrap();

    pub static ref REFUND_FAILURES: Counter = register_counter!(
        "bridge_refund_failures_total",
        "Total number of exhausted refund sequences (operator must act)"
    ).unwrap();

    // External chain adapter
    pub static ref ADAPTER_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_adapter_latency_seconds",
        "Latency of external-chain adapter calls",
        &["operation"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Staleness
    pub static ref STALE_TRANSACTIONS: Gauge = register_gauge!(
        "bridge_stale_transactions",
        "Non-terminal transactions older than the staleness threshold"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "bridge_up",
        "Whether the bridge engine is up and running"
    ).unwrap();
}

/// Record a completed or rejected bridge request
pub fn record_request(direction: &str, outcome: &str) {
    BRIDGE_REQUESTS
        .with_label_values(&[direction, outcome])
        .inc();
}

/// Record a rejection by stable error code
pub fn record_rejection(code: &str) {
    REJECTIONS.with_label_values(&[code]).inc();
}

/// Mirror the breaker state into the gauge
pub fn set_breaker_open(open: bool) {
    BREAKER_OPEN.set(if open { 1.0 } else { 0.0 });
}

/// Record a breaker activation ("auto" or "manual")
pub fn record_breaker_trip(mode: &str) {
    BREAKER_TRIPS.with_label_values(&[mode]).inc();
    set_breaker_open(true);
}

/// Record a security event
pub fn record_security_event(severity: &str, event_type: &str) {
    SECURITY_EVENTS
        .with_label_values(&[severity, event_type])
        .inc();
}

/// Record an exhausted refund sequence
pub fn record_refund_failure() {
    REFUND_FAILURES.inc();
}

/// Record adapter call latency
pub fn observe_adapter_latency(operation: &str, seconds: f64) {
    ADAPTER_LATENCY
        .with_label_values(&[operation])
        .observe(seconds);
}

/// Update the stale transaction gauge
pub fn set_stale_transactions(count: usize) {
    STALE_TRANSACTIONS.set(count as f64);
}
