//! Prometheus metrics for the generate → audit → execute pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Generation Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Generation requests by outcome.
    ///
    /// Labels:
    /// - outcome: "success" or "fallback"
    pub static ref GENERATION_REQUESTS: CounterVec = register_counter_vec!(
        "polyflow_generation_requests_total",
        "Chat-completion requests by outcome",
        &["outcome"]
    ).expect("failed to register GENERATION_REQUESTS metric");

    /// Wall-clock time of a generation request, fallback included.
    pub static ref GENERATION_DURATION: Histogram = register_histogram!(
        "polyflow_generation_duration_seconds",
        "Time spent waiting on the completion endpoint",
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0]
    ).expect("failed to register GENERATION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Programs rejected by the static audit.
    pub static ref AUDIT_REJECTIONS: Counter = register_counter!(
        "polyflow_audit_rejections_total",
        "Generated programs rejected before execution"
    ).expect("failed to register AUDIT_REJECTIONS metric");

    /// Executions by mode and terminal status.
    ///
    /// Labels:
    /// - mode: "stream" or "buffered"
    /// - status: "success", "error", "timeout", "stopped", "failed"
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "polyflow_code_executions_total",
        "Sandboxed executions by terminal status",
        &["mode", "status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    /// Execution duration from launch to terminal status.
    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "polyflow_code_execution_duration_seconds",
        "Sandboxed execution wall-clock time",
        &["mode"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 45.0, 60.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    /// 1 while the execution slot is held, 0 otherwise.
    pub static ref EXECUTIONS_IN_FLIGHT: Gauge = register_gauge!(
        "polyflow_executions_in_flight",
        "Child processes currently running"
    ).expect("failed to register EXECUTIONS_IN_FLIGHT metric");

    /// Execution requests refused because the slot was taken.
    pub static ref SLOT_CONFLICTS: Counter = register_counter!(
        "polyflow_slot_conflicts_total",
        "Execution requests rejected while another run was active"
    ).expect("failed to register SLOT_CONFLICTS metric");
}

/// Render every registered metric in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_touched_metrics() {
        SLOT_CONFLICTS.inc_by(0.0);
        GENERATION_REQUESTS.with_label_values(&["success"]).inc_by(0.0);
        let text = encode_metrics();
        assert!(text.contains("polyflow_slot_conflicts_total"));
        assert!(text.contains("polyflow_generation_requests_total"));
    }
}
