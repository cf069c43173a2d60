//! faythe-exporter — internal telemetry counters.
//!
//! Write-only facade over the process-wide Prometheus registry. Call
//! sites never touch the raw collectors; they go through the `report_*`
//! helpers so label sets stay consistent.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

static ACTION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "faythe_action_failures_total",
        "Failed rule action dispatches",
        &["cluster", "endpoint"]
    )
    .unwrap()
});

static WORKERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "faythe_workers",
        "Workers currently registered on this node",
        &["cluster", "kind"]
    )
    .unwrap()
});

static CLUSTER_MEMBERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "faythe_cluster_members",
        "Live members in the cluster",
        &["cluster"]
    )
    .unwrap()
});

static KV_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "faythe_kv_retries_total",
        "Retried keyspace operations",
        &["op"]
    )
    .unwrap()
});

/// Count one failed action dispatch.
pub fn report_action_failure(cluster: &str, endpoint: &str) {
    ACTION_FAILURES.with_label_values(&[cluster, endpoint]).inc();
}

/// Set the number of registered workers of one kind.
pub fn report_workers(cluster: &str, kind: &str, count: i64) {
    WORKERS.with_label_values(&[cluster, kind]).set(count);
}

/// Set the live member count.
pub fn report_cluster_members(cluster: &str, count: i64) {
    CLUSTER_MEMBERS.with_label_values(&[cluster]).set(count);
}

/// Count one retried keyspace operation.
pub fn report_kv_retry(op: &str) {
    KV_RETRIES.with_label_values(&[op]).inc();
}

/// Render the registry in Prometheus text exposition format.
pub fn text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
