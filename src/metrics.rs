//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Master commits (minted versions vs. no-op commits)
//! - Chunk traffic and compression savings
//! - Slave version application and partial consumption
//! - Version history obsoletion and subscriber counts
//! - Receive buffer pool efficiency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `object_replication_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use object_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_commit("Delta", true, Duration::from_micros(80));
//! metrics::record_chunk_sent("Delta", 4096, 1024);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a master commit. `minted` is false for commits that wrote nothing.
pub fn record_commit(change_manager: &str, minted: bool, duration: Duration) {
    let outcome = if minted { "minted" } else { "noop" };
    counter!(
        "object_replication_commits_total",
        "change_manager" => change_manager.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("object_replication_commit_duration_seconds", "change_manager" => change_manager.to_string())
        .record(duration.as_secs_f64());
}

/// Record one chunk emitted by an output stream.
pub fn record_chunk_sent(kind: &str, uncompressed: usize, wire: usize) {
    counter!("object_replication_chunks_sent_total", "kind" => kind.to_string()).increment(1);
    counter!("object_replication_bytes_sent_total", "kind" => kind.to_string()).increment(wire as u64);
    if wire < uncompressed {
        counter!("object_replication_compression_saved_bytes_total")
            .increment((uncompressed - wire) as u64);
    }
}

/// Record a transport send failure (usually a departed subscriber).
pub fn record_send_failure(peer_id: &str) {
    counter!("object_replication_send_failures_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record a version applied on a slave.
pub fn record_version_applied(change_manager: &str, kind: &str) {
    counter!(
        "object_replication_versions_applied_total",
        "change_manager" => change_manager.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record bytes left unread by an application deserializer.
pub fn record_partial_consumption(type_name: &str, remaining: usize) {
    counter!("object_replication_partial_consumptions_total", "type" => type_name.to_string())
        .increment(1);
    histogram!("object_replication_partial_consumption_bytes").record(remaining as f64);
}

/// Record a protocol violation detected on a slave.
pub fn record_protocol_violation(reason: &str) {
    counter!("object_replication_protocol_violations_total", "reason" => reason.to_string())
        .increment(1);
}

/// Record retained versions evicted from a master's history.
pub fn record_obsoleted(count: usize) {
    if count > 0 {
        counter!("object_replication_obsoleted_versions_total").increment(count as u64);
    }
}

/// Gauge for retained history depth on a master.
pub fn set_history_depth(object_id: &str, depth: usize) {
    gauge!("object_replication_history_depth", "object_id" => object_id.to_string()).set(depth as f64);
}

/// Gauge for distinct subscribed nodes on a master.
pub fn set_subscribed_nodes(object_id: &str, count: usize) {
    gauge!("object_replication_subscribed_nodes", "object_id" => object_id.to_string()).set(count as f64);
}

/// Gauge for completed-but-unapplied streams on a slave.
pub fn set_queued_versions(object_id: &str, count: usize) {
    gauge!("object_replication_queued_versions", "object_id" => object_id.to_string()).set(count as f64);
}

/// Record a receive buffer allocation.
pub fn record_command_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("object_replication_command_cache_total", "outcome" => outcome).increment(1);
}

/// Record an inbound frame that could not be decoded or dispatched.
pub fn record_dropped_frame(reason: &str) {
    counter!("object_replication_dropped_frames_total", "reason" => reason.to_string()).increment(1);
}

/// Record how long a slave `sync` call waited.
pub fn record_sync_wait(duration: Duration) {
    histogram!("object_replication_sync_wait_seconds").record(duration.as_secs_f64());
}
