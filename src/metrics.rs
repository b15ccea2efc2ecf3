// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for reactive-store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `reactive_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, set, merge, merge_collection, remove, clear
//! - `status`: success, error, rejected
//! - `strategy`: direct_key_map, global_broadcast, intercepted_tree, dependency_nodes

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "reactive_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "reactive_store_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache lookup (`hit`, `miss` or `tombstone`)
pub fn record_cache_lookup(result: &str) {
    counter!(
        "reactive_store_cache_lookups_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record LRU evictions
pub fn record_eviction(count: usize) {
    counter!("reactive_store_evictions_total").increment(count as u64);
}

/// Record a read-through fetch that either started or joined a single flight
pub fn record_single_flight(joined: bool) {
    let outcome = if joined { "joined" } else { "started" };
    counter!(
        "reactive_store_single_flight_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record notifications delivered to subscriptions
pub fn record_notifications(strategy: &str, count: usize) {
    counter!(
        "reactive_store_notifications_total",
        "strategy" => strategy.to_string()
    )
    .increment(count as u64);
}

/// Record notifications suppressed because the payload was unchanged
pub fn record_suppressed(strategy: &str, count: usize) {
    counter!(
        "reactive_store_notifications_suppressed_total",
        "strategy" => strategy.to_string()
    )
    .increment(count as u64);
}

/// Record how many listeners a strategy evaluated for one publish
pub fn record_fan_out_evaluations(strategy: &str, count: usize) {
    histogram!(
        "reactive_store_fan_out_evaluations",
        "strategy" => strategy.to_string()
    )
    .record(count as f64);
}

/// Record a durable write outcome
pub fn record_durable_write(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "reactive_store_durable_writes_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set current live connection count
pub fn set_connections(count: usize) {
    gauge!("reactive_store_connections").set(count as f64);
}

/// Set current resident cache key count
pub fn set_cached_keys(count: usize) {
    gauge!("reactive_store_cached_keys").set(count as f64);
}

/// Set store lifecycle state (as numeric for alerting)
pub fn set_store_state(state: &str) {
    let state_num = match state {
        "Created" => 0.0,
        "Initializing" => 1.0,
        "Ready" => 2.0,
        "Disposed" => 3.0,
        _ => -1.0,
    };
    gauge!("reactive_store_state").set(state_num);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Most of these only verify the calls don't panic without an installed recorder.

    #[test]
    fn test_record_operation() {
        record_operation("set", "success");
        record_operation("merge", "rejected");
        record_latency("get", Duration::from_micros(100));
    }

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("hit");
        record_cache_lookup("tombstone");
        record_eviction(3);
        record_single_flight(false);
        record_single_flight(true);
        set_cached_keys(42);
    }

    #[test]
    fn test_notification_metrics() {
        record_notifications("direct_key_map", 4);
        record_suppressed("global_broadcast", 1);
        record_fan_out_evaluations("intercepted_tree", 12);
        set_connections(2);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("get");
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    #[test]
    fn test_counters_reach_installed_recorder() {
        use metrics_util::debugging::{DebugValue, DebuggingRecorder};
        use std::collections::HashMap;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            record_cache_lookup("hit");
            record_cache_lookup("hit");
            record_eviction(3);
            set_cached_keys(7);
        });

        let mut counters = HashMap::new();
        let mut gauges = HashMap::new();
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            let name = key.key().name().to_string();
            match value {
                DebugValue::Counter(v) => {
                    counters.insert(name, v);
                }
                DebugValue::Gauge(v) => {
                    gauges.insert(name, v.into_inner());
                }
                DebugValue::Histogram(_) => {}
            }
        }
        assert_eq!(counters.get("reactive_store_cache_lookups_total"), Some(&2));
        assert_eq!(counters.get("reactive_store_evictions_total"), Some(&3));
        assert_eq!(gauges.get("reactive_store_cached_keys"), Some(&7.0));
    }

    #[test]
    fn test_store_state_tracking() {
        set_store_state("Created");
        set_store_state("Ready");
        set_store_state("Disposed");
        record_durable_write("set_item", false);
    }
}
