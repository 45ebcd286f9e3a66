//! Metrics definitions for the tally node service.
//!
//! This module defines all metrics keys used by the service and
//! provides a helper [`describe_metrics`] to set metadata for
//! each metric using the `metrics` crate.

/// Metrics key for counting shares accepted into aggregation state.
pub const METRICS_ID_NODE_SHARES_RECEIVED: &str = "tally.node.shares.received";
/// Metrics key for currently active per-computation aggregation states.
pub const METRICS_ID_NODE_COMPUTATIONS_ACTIVE: &str = "tally.node.computations.active";
/// Metrics key for computations completed by this node as primary.
pub const METRICS_ID_NODE_COMPUTATIONS_COMPLETED: &str = "tally.node.computations.completed";
/// Metrics key for computations failed on this node.
pub const METRICS_ID_NODE_COMPUTATIONS_FAILED: &str = "tally.node.computations.failed";
/// Metrics key for message send attempts that had to be retried.
pub const METRICS_ID_NODE_SEND_RETRIES: &str = "tally.node.send.retries";
/// Metrics key for per-endpoint failures during broadcasts.
pub const METRICS_ID_NODE_BROADCAST_FAILURES: &str = "tally.node.broadcast.failures";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_NODE_SHARES_RECEIVED,
        metrics::Unit::Count,
        "Number of shares accepted into aggregation state"
    );

    metrics::describe_gauge!(
        METRICS_ID_NODE_COMPUTATIONS_ACTIVE,
        metrics::Unit::Count,
        "Number of active per-computation aggregation states"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_COMPUTATIONS_COMPLETED,
        metrics::Unit::Count,
        "Number of computations this node completed as primary"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_COMPUTATIONS_FAILED,
        metrics::Unit::Count,
        "Number of computations that reached a failure state on this node"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_SEND_RETRIES,
        metrics::Unit::Count,
        "Number of message send attempts that had to be retried"
    );

    metrics::describe_counter!(
        METRICS_ID_NODE_BROADCAST_FAILURES,
        metrics::Unit::Count,
        "Number of per-endpoint failures during broadcasts"
    )
}
