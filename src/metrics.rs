//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbox Metrics
    pub static ref INBOX_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_inbox_requests_total", "Total number of inbox POST requests"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref INBOX_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedengine_inbox_request_duration_seconds",
            "Inbox POST handling duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["outcome"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_activities_received_total", "Total number of activities accepted into an inbox"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_activities_dispatched_total", "Total number of activities handed to a callback"),
        &["route"]
    ).expect("metric can be created");
    pub static ref INBOX_FORWARDING_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_inbox_forwarding_total", "Inbox forwarding decisions"),
        &["decision"]
    ).expect("metric can be created");
    pub static ref COLLECTION_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_collection_fetches_total", "Remote dereferences made while expanding recipients"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_TARGETS_RESOLVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_delivery_targets_resolved_total", "Inbox endpoints produced by recipient resolution"),
        &["audience"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_deliveries_total", "Total number of outbound inbox deliveries"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedengine_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedengine_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(INBOX_REQUESTS_TOTAL.clone()))
        .expect("INBOX_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(INBOX_REQUEST_DURATION_SECONDS.clone()))
        .expect("INBOX_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_DISPATCHED.clone()))
        .expect("ACTIVITIES_DISPATCHED can be registered");
    REGISTRY
        .register(Box::new(INBOX_FORWARDING_TOTAL.clone()))
        .expect("INBOX_FORWARDING_TOTAL can be registered");
    REGISTRY
        .register(Box::new(COLLECTION_FETCHES_TOTAL.clone()))
        .expect("COLLECTION_FETCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_TARGETS_RESOLVED.clone()))
        .expect("DELIVERY_TARGETS_RESOLVED can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
