//! Sample Store: the in-memory ring of recent samples per server, plus the
//! background flush path to a durable [`sink::MetricsSink`].
//!
//! Grounded on the teacher's `session::manager` pattern of a `dashmap`-style
//! cache keyed by server identity holding per-server state lazily created on
//! first use, here storing a [`ring::SampleRing`] behind a `parking_lot`
//! lock rather than an SSH client.

mod ring;
pub mod sink;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::models::{MetricsSample, ServerId, SystemInfo};

use ring::SampleRing;
use sink::{MetricsSink, SinkFlusher};

/// Owns one [`SampleRing`] per server and forwards every accepted sample to
/// the durable-sink flusher. Reads never touch the sink; they're served
/// entirely from the in-memory ring.
pub struct Store {
    rings: DashMap<ServerId, Arc<RwLock<SampleRing>>>,
    system_info: DashMap<ServerId, SystemInfo>,
    capacity: usize,
    sink_tx: mpsc::Sender<MetricsSample>,
    flusher: SinkFlusher,
}

impl Store {
    pub fn new(capacity: usize, sink: Arc<dyn MetricsSink>, batch_size: usize, flush_interval: std::time::Duration, cancel: tokio_util::sync::CancellationToken) -> Self {
        let (flusher, sink_tx) = SinkFlusher::spawn(sink, batch_size, flush_interval, cancel);
        Self {
            rings: DashMap::new(),
            system_info: DashMap::new(),
            capacity,
            sink_tx,
            flusher,
        }
    }

    /// Appends `sample` to its server's ring and enqueues it for durable
    /// persistence. An out-of-order sample is rejected and never reaches
    /// the sink.
    pub async fn submit(&self, sample: MetricsSample) -> Result<(), StoreError> {
        let ring = self
            .rings
            .entry(sample.server_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SampleRing::new(self.capacity))))
            .clone();

        ring.write().push(sample.clone())?;

        if self.sink_tx.send(sample).await.is_err() {
            log::warn!("sink flusher channel closed, sample accepted in-memory but not queued for persistence");
        }

        Ok(())
    }

    pub fn query_latest(&self, server_id: &ServerId) -> Option<MetricsSample> {
        self.rings.get(server_id)?.read().latest().cloned()
    }

    pub fn query_recent(&self, server_id: &ServerId, limit: usize) -> Vec<MetricsSample> {
        self.rings
            .get(server_id)
            .map(|ring| ring.read().recent(limit))
            .unwrap_or_default()
    }

    pub fn query_range(&self, server_id: &ServerId, from_ms: i64, to_ms: i64) -> Vec<MetricsSample> {
        self.rings
            .get(server_id)
            .map(|ring| ring.read().range(from_ms, to_ms))
            .unwrap_or_default()
    }

    /// Same as [`Self::query_range`], but also reports whether the ring's
    /// retained history reaches back far enough to cover `from_ms`. When the
    /// ring is full and its oldest retained sample postdates `from_ms`, the
    /// requested range exceeds ring capacity and the caller must consult the
    /// durable sink for the missing tail (spec §4.5).
    pub fn query_range_checked(&self, server_id: &ServerId, from_ms: i64, to_ms: i64) -> (Vec<MetricsSample>, bool) {
        let Some(ring) = self.rings.get(server_id) else {
            return (Vec::new(), false);
        };
        let ring = ring.read();
        let samples = ring.range(from_ms, to_ms);
        let partial = ring.is_full() && ring.oldest().is_some_and(|s| s.timestamp_ms > from_ms);
        (samples, partial)
    }

    /// `true` once the durable sink has been failing repeatedly; the
    /// in-memory ring keeps serving reads regardless.
    pub fn sink_degraded(&self) -> bool {
        self.flusher.is_degraded()
    }

    /// Replaces the cached `SystemInfo` for a server, refreshed by the
    /// Scheduler on first connect and on its daily cadence (spec §3).
    pub fn set_system_info(&self, server_id: ServerId, info: SystemInfo) {
        self.system_info.insert(server_id, info);
    }

    pub fn system_info(&self, server_id: &ServerId) -> Option<SystemInfo> {
        self.system_info.get(server_id).map(|e| e.clone())
    }

    pub fn server_count(&self) -> usize {
        self.rings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuRecord, DiskRecord, MemoryRecord, NetworkRecord, ServerStatus};
    use sink::LoggingSink;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn sample(server_id: &str, timestamp_ms: i64, seq: u64) -> MetricsSample {
        MetricsSample {
            server_id: ServerId::from(server_id),
            timestamp_ms,
            seq,
            cpu: CpuRecord::default(),
            memory: MemoryRecord::default(),
            disk: DiskRecord::default(),
            network: NetworkRecord::default(),
            status: ServerStatus::Online,
        }
    }

    #[tokio::test]
    async fn submit_then_query_latest_round_trips() {
        let store = Store::new(10, Arc::new(LoggingSink), 4, Duration::from_millis(50), CancellationToken::new());
        store.submit(sample("srv-1", 1000, 1)).await.unwrap();
        store.submit(sample("srv-1", 2000, 2)).await.unwrap();

        let latest = store.query_latest(&ServerId::from("srv-1")).unwrap();
        assert_eq!(latest.timestamp_ms, 2000);
        assert_eq!(store.query_recent(&ServerId::from("srv-1"), 10).len(), 2);
    }

    #[tokio::test]
    async fn unknown_server_returns_empty_results() {
        let store = Store::new(10, Arc::new(LoggingSink), 4, Duration::from_millis(50), CancellationToken::new());
        assert!(store.query_latest(&ServerId::from("ghost")).is_none());
        assert!(store.query_recent(&ServerId::from("ghost"), 10).is_empty());
    }

    #[tokio::test]
    async fn out_of_order_submit_is_rejected() {
        let store = Store::new(10, Arc::new(LoggingSink), 4, Duration::from_millis(50), CancellationToken::new());
        store.submit(sample("srv-1", 2000, 2)).await.unwrap();
        let result = store.submit(sample("srv-1", 1000, 1)).await;
        assert!(matches!(result, Err(StoreError::OutOfOrder(1000))));
    }

    #[tokio::test]
    async fn range_query_is_flagged_partial_once_ring_has_evicted_its_start() {
        let store = Store::new(2, Arc::new(LoggingSink), 4, Duration::from_millis(50), CancellationToken::new());
        for seq in 1..=3u64 {
            store.submit(sample("srv-1", seq as i64 * 1000, seq)).await.unwrap();
        }
        // Ring capacity 2 now holds timestamps [2000, 3000]; asking from 0 can't
        // be satisfied from the ring alone.
        let (samples, partial) = store.query_range_checked(&ServerId::from("srv-1"), 0, 5000);
        assert_eq!(samples.len(), 2);
        assert!(partial);
    }

    #[tokio::test]
    async fn range_query_within_retained_history_is_not_partial() {
        let store = Store::new(10, Arc::new(LoggingSink), 4, Duration::from_millis(50), CancellationToken::new());
        store.submit(sample("srv-1", 1000, 1)).await.unwrap();
        store.submit(sample("srv-1", 2000, 2)).await.unwrap();
        let (samples, partial) = store.query_range_checked(&ServerId::from("srv-1"), 0, 5000);
        assert_eq!(samples.len(), 2);
        assert!(!partial);
    }
}
