//! Prometheus metrics for the transaction engine

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Requests accepted by the ingest filter
    pub static ref REQUESTS_RECEIVED_TOTAL: CounterVec = register_counter_vec!(
        "ledger_requests_received_total",
        "Requests accepted by the ingest filter",
        &["variant"]
    )
    .unwrap();

    /// Terminal outcomes per request
    pub static ref REQUEST_OUTCOME_TOTAL: CounterVec = register_counter_vec!(
        "ledger_request_outcome_total",
        "Terminal request outcomes",
        &["variant", "outcome"]
    )
    .unwrap();

    /// Transient faults that re-entered the handler
    pub static ref REQUEST_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "ledger_request_retries_total",
        "Transient faults that re-entered the handler",
        &["variant"]
    )
    .unwrap();

    /// Outbox publish duration
    pub static ref OUTBOX_PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "ledger_outbox_publish_duration_seconds",
        "Outbox publish duration in seconds",
        &["kind"]
    )
    .unwrap();
}
