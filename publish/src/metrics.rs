//! Prometheus metrics for the publisher.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    /// Publish attempts by mode and result code.
    pub static ref PUBLISH_COUNT: IntCounterVec = register_int_counter_vec!(
        "janitor_publish_attempts_total",
        "Number of publish attempts by mode and result code",
        &["mode", "result_code"]
    )
    .unwrap();

    /// Publications blocked by a bucket limit.
    pub static ref RATE_LIMITED_COUNT: IntCounter = register_int_counter!(
        "janitor_publish_rate_limited_total",
        "Number of publications blocked by a rate-limit bucket"
    )
    .unwrap();

    /// Proposal status transitions observed by the scanner.
    pub static ref PROPOSAL_STATUS_COUNT: IntCounterVec = register_int_counter_vec!(
        "janitor_publish_proposal_transitions_total",
        "Number of proposal status transitions observed",
        &["status"]
    )
    .unwrap();
}

/// Render all registered metrics in the text exposition format.
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
