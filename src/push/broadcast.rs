//! Encode-once fan-out: a sample or threshold event is serialized a single
//! time per distinct metric-filter shape and the same bytes are handed to
//! every matching connection that shares that shape, rather than
//! re-encoding per subscriber.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;

use crate::models::{ConnectionId, MetricKind, MetricsSample, ServerId};
use crate::threshold::PushEvent;

use super::connection::{Connection, TrySendError};
use super::protocol::ServerMessage;

/// Messages smaller than this are sent as plain JSON text; larger ones are
/// gzip-compressed, since most samples are small and compression overhead
/// isn't worth paying on every frame.
const COMPRESSION_THRESHOLD_BYTES: usize = 1024;

/// A JSON-encoded frame, compressed if it crossed the size threshold.
pub struct EncodedFrame {
    pub json: String,
    pub gzipped: Option<Vec<u8>>,
}

pub fn encode(message: ServerMessage) -> EncodedFrame {
    let envelope = message.into_envelope();
    let json = serde_json::to_string(&envelope).unwrap_or_else(|err| {
        warn!("failed to encode server message, sending error frame instead: {err}");
        let fallback = ServerMessage::Error {
            code: "internal_error",
            message: "internal encoding error".to_string(),
        }
        .into_envelope();
        serde_json::to_string(&fallback).expect("Error variant always encodes")
    });

    let gzipped = if json.len() > COMPRESSION_THRESHOLD_BYTES {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        match encoder.write_all(json.as_bytes()).and_then(|_| encoder.finish()) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("gzip compression failed, falling back to uncompressed frame: {err}");
                None
            }
        }
    } else {
        None
    };

    EncodedFrame { json, gzipped }
}

/// Applies the eviction decision for one connection's send attempt: a full
/// queue is a drop, counted against the rolling slow-consumer ceiling
/// (spec §4.7.1); only crossing that ceiling evicts the connection. A
/// closed channel always evicts.
fn record_send(conn: &Connection, result: Result<(), TrySendError>, evicted: &mut Vec<ConnectionId>) {
    match result {
        Ok(()) => {}
        Err(TrySendError::QueueFull) => {
            if conn.record_drop() {
                warn!("connection {} exceeded drop ceiling, evicting as slow consumer", conn.id);
                evicted.push(conn.id);
            }
        }
        Err(TrySendError::Closed) => evicted.push(conn.id),
    }
}

/// Delivers a `MetricsSample` to every connection whose subscription
/// matches `sample.server_id` and `sample.status`, masking out any metric
/// sub-record the connection didn't ask for. Connections that share the
/// same (metric-filter) shape reuse one encoded frame.
pub fn fanout_metrics(connections: &DashMap<ConnectionId, Arc<Connection>>, sample: &MetricsSample) -> Vec<ConnectionId> {
    let mut evicted = Vec::new();
    let mut cache: HashMap<Option<[bool; 4]>, ServerMessage> = HashMap::new();

    for entry in connections.iter() {
        let conn = entry.value();
        let sub = conn.subscription.read();
        if !sub.matches_server(&sample.server_id) || !sub.matches_status(sample.status) {
            continue;
        }
        let key = sub.metrics_filter().map(|set| {
            [
                set.contains(&MetricKind::Cpu),
                set.contains(&MetricKind::Memory),
                set.contains(&MetricKind::Disk),
                set.contains(&MetricKind::Network),
            ]
        });
        drop(sub);

        let message = cache
            .entry(key)
            .or_insert_with(|| ServerMessage::Metrics(masked_sample(sample, key)))
            .clone();
        record_send(conn, conn.try_send(message), &mut evicted);
    }
    evicted
}

/// Returns `sample` with any sub-record outside `mask` cleared to its
/// default (`missing = true`), matching spec S1's "payload omits
/// unsubscribed metrics" requirement. `None` mask means "all metrics".
fn masked_sample(sample: &MetricsSample, mask: Option<[bool; 4]>) -> MetricsSample {
    let mut sample = sample.clone();
    if let Some([cpu, memory, disk, network]) = mask {
        if !cpu {
            sample.cpu = Default::default();
        }
        if !memory {
            sample.memory = Default::default();
        }
        if !disk {
            sample.disk = Default::default();
        }
        if !network {
            sample.network = Default::default();
        }
    }
    sample
}

/// Delivers a threshold or server-status event to every connection
/// subscribed to its server, irrespective of `min_status` (a status
/// transition is always worth telling a subscriber about, even one
/// filtering at a higher floor).
pub fn fanout_event(connections: &DashMap<ConnectionId, Arc<Connection>>, server_id: &ServerId, event: Arc<PushEvent>) -> Vec<ConnectionId> {
    let mut evicted = Vec::new();
    let message = ServerMessage::StatusChange((*event).clone().into());
    for entry in connections.iter() {
        let conn = entry.value();
        if !conn.subscription.read().matches_server(server_id) {
            continue;
        }
        record_send(conn, conn.try_send(message.clone()), &mut evicted);
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuRecord, DiskRecord, MemoryRecord, NetworkRecord, ServerStatus};

    fn sample() -> MetricsSample {
        MetricsSample {
            server_id: ServerId::from("srv-1"),
            timestamp_ms: 1_000,
            seq: 1,
            cpu: CpuRecord {
                usage_percent: Some(42.5),
                ..Default::default()
            },
            memory: MemoryRecord {
                used_bytes: Some(123),
                ..Default::default()
            },
            disk: DiskRecord::default(),
            network: NetworkRecord::default(),
            status: ServerStatus::Online,
        }
    }

    #[test]
    fn masking_clears_unsubscribed_metrics_but_keeps_asked_for_ones() {
        let masked = masked_sample(&sample(), Some([true, true, false, false]));
        assert_eq!(masked.cpu.usage_percent, Some(42.5));
        assert_eq!(masked.memory.used_bytes, Some(123));
        assert!(masked.disk.partitions.is_empty());
    }

    #[test]
    fn no_mask_keeps_every_metric() {
        let masked = masked_sample(&sample(), None);
        assert_eq!(masked.cpu.usage_percent, Some(42.5));
    }

    #[test]
    fn small_message_is_not_compressed() {
        let frame = encode(ServerMessage::Heartbeat);
        assert!(frame.gzipped.is_none());
    }

    #[test]
    fn large_message_is_compressed() {
        let samples: Vec<MetricsSample> = (0..50).map(|_| sample()).collect();
        let frame = encode(ServerMessage::History {
            server_id: ServerId::from("srv-1"),
            metric: MetricKind::Cpu,
            samples,
            partial: false,
        });
        assert!(frame.json.len() > COMPRESSION_THRESHOLD_BYTES);
        assert!(frame.gzipped.is_some());
    }
}
