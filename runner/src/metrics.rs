//! Prometheus metrics for the runner.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// Assignments handed out to workers.
    pub static ref ASSIGNMENT_COUNT: IntCounter = register_int_counter!(
        "janitor_runner_assignments_total",
        "Number of assignments handed out to workers"
    )
    .unwrap();

    /// Finished runs by result code.
    pub static ref FINISH_COUNT: IntCounterVec = register_int_counter_vec!(
        "janitor_runner_finishes_total",
        "Number of finished runs by result code",
        &["result_code"]
    )
    .unwrap();

    /// Runs reaped by the watchdog, by reason.
    pub static ref TERMINATION_COUNT: IntCounterVec = register_int_counter_vec!(
        "janitor_runner_terminations_total",
        "Number of runs terminated by the watchdog, by reason",
        &["reason"]
    )
    .unwrap();

    /// Assignments rolled back because the worker never called back.
    pub static ref HANDSHAKE_EXPIRED_COUNT: IntCounter = register_int_counter!(
        "janitor_runner_handshake_expired_total",
        "Number of assignments rolled back after the handshake window"
    )
    .unwrap();

    /// Current number of active runs.
    pub static ref ACTIVE_RUN_GAUGE: IntGauge = register_int_gauge!(
        "janitor_runner_active_runs",
        "Number of currently active runs"
    )
    .unwrap();

    /// Current queue length.
    pub static ref QUEUE_LENGTH_GAUGE: IntGauge = register_int_gauge!(
        "janitor_runner_queue_length",
        "Number of pending queue entries"
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

#[cfg(test)]
mod tests {
    #[test]
    fn test_gather_contains_registered_metrics() {
        super::ASSIGNMENT_COUNT.inc();
        let text = super::gather();
        assert!(text.contains("janitor_runner_assignments_total"));
    }
}
