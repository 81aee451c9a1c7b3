//! Fixed-capacity, single-writer-per-server ring buffer of samples.

use std::collections::VecDeque;

use crate::error::StoreError;
use crate::models::MetricsSample;

/// Holds the most recent `capacity` samples for one server, oldest evicted
/// first. Samples must arrive in non-decreasing `(timestamp_ms, seq)` order;
/// an older sample than the last accepted one is rejected rather than
/// silently reordering the buffer.
pub struct SampleRing {
    capacity: usize,
    samples: VecDeque<MetricsSample>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Appends `sample`, evicting the oldest entry if the ring is full.
    pub fn push(&mut self, sample: MetricsSample) -> Result<(), StoreError> {
        if let Some(last) = self.samples.back() {
            if (sample.timestamp_ms, sample.seq) <= (last.timestamp_ms, last.seq) {
                return Err(StoreError::OutOfOrder(sample.timestamp_ms));
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    pub fn latest(&self) -> Option<&MetricsSample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&MetricsSample> {
        self.samples.front()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Returns up to `limit` most recent samples, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MetricsSample> {
        let skip = self.samples.len().saturating_sub(limit);
        self.samples.iter().skip(skip).cloned().collect()
    }

    /// Returns samples with `timestamp_ms` in `[from_ms, to_ms]`, oldest first.
    pub fn range(&self, from_ms: i64, to_ms: i64) -> Vec<MetricsSample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp_ms >= from_ms && s.timestamp_ms <= to_ms)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuRecord, DiskRecord, MemoryRecord, NetworkRecord, ServerId, ServerStatus};

    fn sample(timestamp_ms: i64, seq: u64) -> MetricsSample {
        MetricsSample {
            server_id: ServerId::from("srv-1"),
            timestamp_ms,
            seq,
            cpu: CpuRecord::default(),
            memory: MemoryRecord::default(),
            disk: DiskRecord::default(),
            network: NetworkRecord::default(),
            status: ServerStatus::Online,
        }
    }

    #[test]
    fn evicts_oldest_once_full() {
        let mut ring = SampleRing::new(2);
        ring.push(sample(1, 1)).unwrap();
        ring.push(sample(2, 2)).unwrap();
        ring.push(sample(3, 3)).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.recent(10)[0].timestamp_ms, 2);
    }

    #[test]
    fn rejects_out_of_order_sample() {
        let mut ring = SampleRing::new(10);
        ring.push(sample(10, 1)).unwrap();
        let err = ring.push(sample(5, 2)).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder(5)));
    }

    #[test]
    fn latest_returns_most_recent() {
        let mut ring = SampleRing::new(10);
        ring.push(sample(1, 1)).unwrap();
        ring.push(sample(2, 2)).unwrap();
        assert_eq!(ring.latest().unwrap().timestamp_ms, 2);
    }
}
