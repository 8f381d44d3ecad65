//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Inbound federation
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_activities_received_total", "Total number of activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOX_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_inbox_outcomes_total", "Inbox processing outcomes"),
        &["outcome"]
    ).expect("metric can be created");

    // Outbound federation
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_activities_sent_total", "Total number of activities queued for delivery"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_deliveries_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "forgefed_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["method"]
    ).expect("metric can be created");

    // Queues
    pub static ref QUEUE_PUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_queue_pushes_total", "Items pushed onto a queue"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref QUEUE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_queue_retries_total", "Items handed back for retry"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("forgefed_queue_depth", "Items stored in a queue, leased ones included"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref QUEUE_IN_FLIGHT: IntGauge = IntGauge::new(
        "forgefed_queue_in_flight",
        "Items currently held by queue workers"
    ).expect("metric can be created");

    // Key cache
    pub static ref KEY_CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_key_cache_hits_total", "Public key lookups served from storage"),
        &["owner"]
    ).expect("metric can be created");
    pub static ref KEY_CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_key_cache_misses_total", "Public key lookups that required a fetch"),
        &["owner"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_errors_total", "Total number of errors returned to callers"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Registration errors are logged rather than fatal so that tests building
/// several routers in one process do not trip over duplicate registration.
pub fn init_metrics() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("HTTP_REQUESTS_TOTAL", Box::new(HTTP_REQUESTS_TOTAL.clone())),
        ("ACTIVITIES_RECEIVED", Box::new(ACTIVITIES_RECEIVED.clone())),
        ("INBOX_OUTCOMES", Box::new(INBOX_OUTCOMES.clone())),
        ("ACTIVITIES_SENT", Box::new(ACTIVITIES_SENT.clone())),
        ("DELIVERIES_TOTAL", Box::new(DELIVERIES_TOTAL.clone())),
        (
            "FEDERATION_REQUEST_DURATION_SECONDS",
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        ),
        ("QUEUE_PUSHES_TOTAL", Box::new(QUEUE_PUSHES_TOTAL.clone())),
        ("QUEUE_RETRIES_TOTAL", Box::new(QUEUE_RETRIES_TOTAL.clone())),
        ("QUEUE_DEPTH", Box::new(QUEUE_DEPTH.clone())),
        ("QUEUE_IN_FLIGHT", Box::new(QUEUE_IN_FLIGHT.clone())),
        ("KEY_CACHE_HITS_TOTAL", Box::new(KEY_CACHE_HITS_TOTAL.clone())),
        ("KEY_CACHE_MISSES_TOTAL", Box::new(KEY_CACHE_MISSES_TOTAL.clone())),
        ("ERRORS_TOTAL", Box::new(ERRORS_TOTAL.clone())),
    ];

    for (name, collector) in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(metric = name, %error, "Metric already registered");
        }
    }

    tracing::info!("Metrics registry initialized");
}
