//! Metrics registry for nodeops observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation (duration, errors by reason)
//! - Node lifecycle (nodes by phase, phase transitions)
//! - Status polling (failures)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::NodePhase;

/// Global meter for nodeops metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("nodeops"));

/// Every phase, for exporting zero counts
pub const ALL_PHASES: [NodePhase; 6] = [
    NodePhase::Pending,
    NodePhase::Initializing,
    NodePhase::Syncing,
    NodePhase::Running,
    NodePhase::Upgrading,
    NodePhase::Failed,
];

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Histogram of node reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("nodeops_reconcile_duration_seconds")
        .with_description("Duration of ManagedNode reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `reason`: InvalidSpec, ApplyFailed, Conflict, ...
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("nodeops_reconcile_errors_total")
        .with_description("Total number of ManagedNode reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Node Lifecycle Metrics
// ============================================================================

/// Gauge tracking managed nodes by phase
///
/// Labels:
/// - `phase`: pending, initializing, syncing, running, upgrading, failed
pub static NODES_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("nodeops_nodes_total")
        .with_description("Number of managed nodes by phase")
        .with_unit("{nodes}")
        .build()
});

/// Counter of phase transitions
///
/// Labels:
/// - `from`, `to`: phase names
pub static PHASE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("nodeops_phase_transitions_total")
        .with_description("Total number of ManagedNode phase transitions")
        .with_unit("{transitions}")
        .build()
});

// ============================================================================
// Status Poll Metrics
// ============================================================================

/// Counter of failed or timed-out status polls
pub static STATUS_POLL_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("nodeops_status_poll_failures_total")
        .with_description("Total number of failed node status polls")
        .with_unit("{polls}")
        .build()
});

fn phase_label(phase: NodePhase) -> String {
    phase.as_str().to_ascii_lowercase()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a node reconciliation with timing
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record error completion
    pub fn error(self, reason: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        RECONCILE_ERRORS.add(1, &[KeyValue::new("reason", reason)]);
    }
}

/// Record a phase transition
pub fn record_transition(from: NodePhase, to: NodePhase) {
    PHASE_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("from", phase_label(from)),
            KeyValue::new("to", phase_label(to)),
        ],
    );
}

/// Update the node count gauge for one phase
pub fn set_phase_count(phase: NodePhase, count: i64) {
    NODES_TOTAL.record(count, &[KeyValue::new("phase", phase_label(phase))]);
}

/// Count a failed status poll
pub fn record_poll_failure() {
    STATUS_POLL_FAILURES.add(1, &[]);
}
