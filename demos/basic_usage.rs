// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic reactive-store usage example.
//!
//! Demonstrates:
//! 1. Starting a store with default keys over the in-memory backend
//! 2. Subscribing to a key and a collection
//! 3. Writing with set, merge and merge_collection
//! 4. Watching a key through a Binding
//! 5. Displaying cache stats and raw metrics
//! 6. Clear and clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use reactive_store::{ConnectOptions, FanOutKind, InMemoryStore, Store, StoreConfig, Target};
use serde_json::{json, Map};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           reactive-store: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the store
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring reactive-store...");
    let config = StoreConfig::default()
        .with_fan_out(FanOutKind::DependencyNodes)
        .with_max_cached_keys(64)
        .with_initial_key("settings", json!({"theme": "dark", "locale": "en"}));
    let store = Store::new(config, Arc::new(InMemoryStore::new()));
    println!("   State: {}", store.lifecycle());

    store.init().await?;
    println!("   ✅ Store ready! State: {}", store.lifecycle());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Subscribe
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔔 Connecting subscribers...");
    let settings = store.connect(ConnectOptions::key("settings", |value| {
        println!("   └─ settings → {value}");
    }))?;
    let reports = store.connect(ConnectOptions::collection("report_", |value| {
        println!("   └─ report_ → {value}");
    }))?;
    tokio::task::yield_now().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Write
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing...");
    store.set("report_1", json!({"total": 3, "owner": "alice"}))?.settled().await?;
    store.merge("settings", json!({"theme": "light"})).await?.settled().await?;

    let mut batch = Map::new();
    batch.insert("report_1".into(), json!({"owner": null}));
    batch.insert("report_2".into(), json!({"total": 7}));
    store.merge_collection("report_", batch).await?.settled().await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Watch through a binding
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n👀 Binding to report_2...");
    let mut binding = store.binding(Target::key("report_2"))?;
    if let Some(value) = binding.changed().await {
        println!("   └─ initial: {value}");
    }
    store.remove("report_2")?.settled().await?;
    if let Some(value) = binding.changed().await {
        println!("   └─ after remove: {value}");
    }
    drop(binding);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Store:");
    let stats = store.cache_stats();
    println!("   ┌─ Cache");
    println!("   │  └─ Resident: {}/{}", stats.resident, stats.capacity);
    println!("   │  └─ Pinned: {} Doomed: {}", stats.pinned, stats.doomed);
    println!("   │  └─ Evicted: {}", stats.evicted_total);
    println!("   └─ Keys: {:?}", store.get_all_keys().await?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clear and shut down
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🧹 Clearing...");
    store.clear()?.settled().await?;
    println!("   └─ settings: {}", store.get("settings").await?);

    store.disconnect(settings);
    store.disconnect(reports);
    store.dispose();
    println!("\n🛑 Shutdown complete! State: {}", store.lifecycle());
    Ok(())
}

/// Dump all captured metrics, grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("{v}"),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.6}", samples.len(), sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
