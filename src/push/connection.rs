//! One accepted WebSocket peer: its outbound queue, subscription filter,
//! heartbeat bookkeeping, and slow-consumer drop tracking.
//!
//! Grounded on the `Dispatcher` client-registration pattern in the restream
//! gateway reference file: each connection gets an id, an outbound `mpsc`
//! channel the fan-out side writes into, and is registered/deregistered
//! from a shared map around the connection's lifetime.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::ConnectionId;

use super::protocol::ServerMessage;
use super::subscription::Subscription;

/// Drops within this rolling window count toward the slow-consumer ceiling
/// (spec §4.7.1: "default 50 within 60 s"). Not an operator-configurable
/// key — §6's closed config set doesn't list it, only `ws_send_queue`.
const DROP_WINDOW: Duration = Duration::from_secs(60);
const DROP_CEILING: u32 = 50;

/// Outbound frame queue depth before a connection is considered a slow
/// consumer and evicted (spec: `ws_send_queue`).
pub struct Connection {
    pub id: ConnectionId,
    pub peer_ip: IpAddr,
    pub subscription: RwLock<Subscription>,
    /// Whether this peer declared GZIP/ZLIB support at handshake (spec
    /// §4.7.5). Frames above the compression threshold are only sent
    /// compressed to connections where this is `true`; everyone else always
    /// gets plain JSON text, regardless of size.
    pub supports_compression: bool,
    tx: mpsc::Sender<ServerMessage>,
    missed_heartbeats: AtomicU32,
    drops: Mutex<VecDeque<Instant>>,
    /// Cancelled by the Push Fabric when it evicts this connection for a
    /// reason the socket loop itself can't observe (heartbeat timeout,
    /// slow-consumer ceiling) so the reader/writer tasks actually tear
    /// down instead of lingering until the peer notices.
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, peer_ip: IpAddr, tx: mpsc::Sender<ServerMessage>, supports_compression: bool) -> Self {
        Self {
            id,
            peer_ip,
            subscription: RwLock::new(Subscription::default()),
            supports_compression,
            tx,
            missed_heartbeats: AtomicU32::new(0),
            drops: Mutex::new(VecDeque::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Signals the socket loop to stop reading/writing and return.
    pub fn force_close(&self) {
        self.closed.cancel();
    }

    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Enqueues a message without blocking.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), TrySendError> {
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TrySendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }

    /// Records one dropped frame and reports whether the rolling ceiling
    /// (spec: `dropped` exceeding 50 within 60s) has now been crossed, in
    /// which case the caller must close this connection with
    /// `slow_consumer`.
    pub fn record_drop(&self) -> bool {
        let now = Instant::now();
        let mut drops = self.drops.lock();
        drops.push_back(now);
        while let Some(front) = drops.front() {
            if now.duration_since(*front) > DROP_WINDOW {
                drops.pop_front();
            } else {
                break;
            }
        }
        drops.len() as u32 > DROP_CEILING
    }

    pub fn note_heartbeat_sent(&self) {
        self.missed_heartbeats.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_pong_received(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError {
    QueueFull,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_reports_queue_full_not_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new_random(), "127.0.0.1".parse().unwrap(), tx, false);
        conn.try_send(ServerMessage::Heartbeat).unwrap();
        assert_eq!(conn.try_send(ServerMessage::Heartbeat), Err(TrySendError::QueueFull));
        rx.recv().await;
    }

    #[test]
    fn heartbeat_counter_resets_on_pong() {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Connection::new(ConnectionId::new_random(), "127.0.0.1".parse().unwrap(), tx, false);
        conn.note_heartbeat_sent();
        conn.note_heartbeat_sent();
        assert_eq!(conn.missed_heartbeats(), 2);
        conn.note_pong_received();
        assert_eq!(conn.missed_heartbeats(), 0);
    }

    #[test]
    fn fiftieth_drop_does_not_evict_fifty_first_does() {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Connection::new(ConnectionId::new_random(), "127.0.0.1".parse().unwrap(), tx, false);
        for _ in 0..DROP_CEILING {
            assert!(!conn.record_drop());
        }
        assert!(conn.record_drop());
    }
}
