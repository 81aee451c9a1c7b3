//! Push Fabric: the WebSocket gateway that streams accepted samples and
//! threshold events to subscribed clients.
//!
//! Grounded on the restream gateway reference file's `Dispatcher` shape
//! (accept, register, split reader/writer, deregister on close) adapted to
//! `axum`'s WebSocket extractor instead of a bespoke Rustls+tungstenite
//! server, since the pack's own `server-monitoring` manifest pairs `axum`'s
//! `ws` feature with exactly this kind of fan-out gateway.

pub mod broadcast;
pub mod connection;
pub mod protocol;
pub mod subscription;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{ConnectionId, MetricsSample};
use crate::store::Store;
use crate::threshold::PushEvent;

use connection::Connection;
use protocol::{ClientMessage, ProtocolDecodeError, ServerMessage, ServerSelector};

/// The closed set of limits the Push Fabric enforces (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct PushFabricConfig {
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub send_queue_depth: usize,
    pub max_message_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout_misses: u32,
}

/// Shared gateway state: every accepted connection plus per-IP admission
/// counters. Cheap to clone (wrapped in `Arc`) for use as `axum` state.
pub struct PushFabric {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    per_ip_counts: DashMap<IpAddr, usize>,
    total: AtomicUsize,
    config: PushFabricConfig,
    store: Arc<Store>,
}

impl PushFabric {
    pub fn new(config: PushFabricConfig, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            per_ip_counts: DashMap::new(),
            total: AtomicUsize::new(0),
            config,
            store,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_handler)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn try_admit(&self, peer_ip: IpAddr) -> Result<(), crate::error::PushError> {
        if self.total.load(Ordering::SeqCst) >= self.config.max_connections {
            return Err(crate::error::PushError::ConnectionLimitReached("global limit reached".into()));
        }
        let mut count = self.per_ip_counts.entry(peer_ip).or_insert(0);
        if *count >= self.config.max_per_ip {
            return Err(crate::error::PushError::ConnectionLimitReached(format!("{peer_ip} at per-IP limit")));
        }
        *count += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, peer_ip: IpAddr, id: ConnectionId) {
        self.connections.remove(&id);
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut count) = self.per_ip_counts.get_mut(&peer_ip) {
            *count = count.saturating_sub(1);
        }
    }

    fn evict(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            conn.force_close();
            self.total.fetch_sub(1, Ordering::SeqCst);
            if let Some(mut count) = self.per_ip_counts.get_mut(&conn.peer_ip) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Forwards every sample the Scheduler broadcasts to matching
    /// subscribers, evicting any connection whose queue can't keep up.
    pub fn spawn_sample_forwarder(self: Arc<Self>, mut rx: tokio::sync::broadcast::Receiver<Arc<MetricsSample>>, cancel: CancellationToken) {
        let fabric = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sample = rx.recv() => {
                        match sample {
                            Ok(sample) => {
                                let evicted = broadcast::fanout_metrics(&fabric.connections, &sample);
                                for id in evicted {
                                    fabric.evict(id);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("push fabric sample forwarder lagged, dropped {n} sample(s)");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Forwards debounced threshold-band transitions, same delivery path as
    /// samples.
    pub fn spawn_event_forwarder(self: Arc<Self>, mut rx: tokio::sync::broadcast::Receiver<Arc<PushEvent>>, cancel: CancellationToken) {
        let fabric = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => {
                        match event {
                            Ok(event) => {
                                let server_id = event.server_id().clone();
                                let evicted = broadcast::fanout_event(&fabric.connections, &server_id, event);
                                for id in evicted {
                                    fabric.evict(id);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("push fabric event forwarder lagged, dropped {n} event(s)");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Periodically pings every connection and evicts any that has missed
    /// too many consecutive heartbeats (spec: dead-peer detection).
    pub fn spawn_heartbeat_task(self: Arc<Self>, cancel: CancellationToken) {
        let fabric = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(fabric.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut to_evict = Vec::new();
                        for entry in fabric.connections.iter() {
                            let conn = entry.value();
                            if conn.missed_heartbeats() >= fabric.config.heartbeat_timeout_misses {
                                to_evict.push(conn.id);
                                continue;
                            }
                            conn.note_heartbeat_sent();
                            if conn.try_send(ServerMessage::Heartbeat).is_err() {
                                to_evict.push(conn.id);
                            }
                        }
                        for id in to_evict {
                            debug!("evicting connection {id}: heartbeat_timeout");
                            fabric.evict(id);
                        }
                    }
                }
            }
        });
    }

    /// Sends a final `SHUTDOWN` frame to every connection, gives the writer
    /// loops a moment to flush it, then force-closes every socket; called
    /// once as part of `Runtime::shutdown`.
    pub async fn shutdown(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().try_send(ServerMessage::Shutdown);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        for entry in self.connections.iter() {
            entry.value().force_close();
        }
    }
}

/// Query parameters accepted on the `/ws` upgrade. `compress=1` is the
/// client's declaration of GZIP support (spec §4.7.5: "if a subscriber
/// indicated compression support at handshake").
#[derive(serde::Deserialize)]
struct HandshakeParams {
    #[serde(default)]
    compress: bool,
}

async fn ws_handler(
    State(fabric): State<Arc<PushFabric>>,
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::Query(params): axum::extract::Query<HandshakeParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(fabric, socket, addr.ip(), params.compress))
}

async fn handle_socket(fabric: Arc<PushFabric>, socket: WebSocket, peer_ip: IpAddr, supports_compression: bool) {
    if fabric.try_admit(peer_ip).is_err() {
        let (mut sink, _) = socket.split();
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let id = ConnectionId::new_random();
    let (tx, mut outbound_rx) = mpsc::channel(fabric.config.send_queue_depth);
    let conn = Arc::new(Connection::new(id, peer_ip, tx, supports_compression));
    fabric.connections.insert(id, conn.clone());
    info!("push fabric: connection {id} from {peer_ip} accepted ({} total)", fabric.connection_count());
    let _ = conn.try_send(ServerMessage::Hello { connection_id: id.to_string() });

    let (mut sink, mut stream) = socket.split();
    let closed = conn.closed_signal();

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closed.cancelled() => break,
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    let frame = broadcast::encode(message);
                    let ws_message = match frame.gzipped {
                        Some(bytes) if supports_compression => Message::Binary(bytes),
                        _ => Message::Text(frame.json),
                    };
                    if sink.send(ws_message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let max_message_bytes = fabric.config.max_message_bytes;
    let mut close_reason = "client_close";
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                close_reason = "evicted";
                break;
            }
            message = stream.next() => {
                let Some(Ok(message)) = message else { break };
                match message {
                    Message::Text(text) => {
                        if text.len() > max_message_bytes {
                            let _ = conn.try_send(ServerMessage::Error {
                                code: "oversize",
                                message: "message exceeds maximum size".to_string(),
                            });
                            close_reason = "oversize";
                            break;
                        }
                        // Any client frame counts as activity for heartbeat purposes
                        // (spec: "without any client frame"), not just an explicit PONG.
                        conn.note_pong_received();
                        handle_client_text(&fabric, &conn, &text);
                    }
                    Message::Pong(_) => conn.note_pong_received(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    debug!("connection {id} reader loop ended: {close_reason}");
    writer.abort();
    if close_reason != "evicted" {
        fabric.release(peer_ip, id);
    }
    info!("push fabric: connection {id} from {peer_ip} closed ({close_reason})");
}

fn handle_client_text(fabric: &Arc<PushFabric>, conn: &Connection, text: &str) {
    match protocol::decode_client_message(text) {
        Ok(ClientMessage::Subscribe { servers, metrics, min_status }) => {
            {
                let mut sub = conn.subscription.write();
                match &servers {
                    ServerSelector::All => sub.replace_all(metrics.clone(), min_status),
                    ServerSelector::Explicit(ids) => sub.replace(ids.clone(), metrics.clone(), min_status),
                }
            }
            let _ = conn.try_send(ServerMessage::SubscribeAck { servers, metrics, min_status });
        }
        Ok(ClientMessage::Unsubscribe { servers }) => {
            conn.subscription.write().remove(&servers);
        }
        Ok(ClientMessage::Ping) => {
            let _ = conn.try_send(ServerMessage::Heartbeat);
        }
        Ok(ClientMessage::Pong) => {
            conn.note_pong_received();
        }
        Ok(ClientMessage::RequestHistory { server, metric, from_ms, to_ms }) => {
            let (samples, partial) = fabric.store.query_range_checked(&server, from_ms, to_ms);
            let _ = conn.try_send(ServerMessage::History {
                server_id: server,
                metric,
                samples,
                partial,
            });
        }
        Err(ProtocolDecodeError::UnknownType(t)) => {
            let _ = conn.try_send(ServerMessage::Error {
                code: "unknown_type",
                message: format!("unrecognized message type {t:?}"),
            });
        }
        Err(err) => {
            let _ = conn.try_send(ServerMessage::Error {
                code: "protocol_error",
                message: err.to_string(),
            });
        }
    }
}
