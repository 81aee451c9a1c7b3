//! Wire protocol for the WebSocket Push Fabric.
//!
//! Every frame, in both directions, is a JSON envelope:
//! `{ "type": "<TYPE>", "ts": <ms since epoch>, "id": "<uuid-optional>", "data": <object> }`.
//! `ServerMessage`/`ClientMessage` model only the `data` payload; [`Envelope`]
//! wraps it with the `type`/`ts`/`id` fields shared by every frame.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{MetricKind, MetricsSample, ServerId, ServerStatus};
use crate::threshold::{Band, PushEvent, StatusTransitionEvent, ThresholdEvent};

/// The envelope every frame is wrapped in before it goes over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            ts: Utc::now().timestamp_millis(),
            id: None,
            data,
        }
    }
}

/// A message a connected client may send, in `SUBSCRIBE.data` shape etc.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Replaces (never merges) this connection's subscription.
    Subscribe {
        servers: ServerSelector,
        metrics: Option<Vec<MetricKind>>,
        min_status: Option<ServerStatus>,
    },
    /// Removes the listed servers; an empty list clears the subscription.
    Unsubscribe { servers: Vec<ServerId> },
    Ping,
    Pong,
    RequestHistory {
        server: ServerId,
        metric: MetricKind,
        from_ms: i64,
        to_ms: i64,
    },
}

/// `SUBSCRIBE.data.servers` is either `"all"` or an explicit id list.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerSelector {
    All,
    Explicit(Vec<ServerId>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolDecodeError {
    #[error("invalid envelope: {0}")]
    Envelope(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed data for {0}: {1}")]
    BadData(&'static str, String),
}

/// Parses one client frame. Unknown `type` values are reported distinctly
/// from malformed `data` so the caller can answer `ERROR{code:"unknown_type"}`
/// without closing the connection (spec §4.7.2).
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolDecodeError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| ProtocolDecodeError::Envelope(e.to_string()))?;
    match envelope.kind.as_str() {
        "SUBSCRIBE" => {
            #[derive(Deserialize)]
            struct Data {
                servers: ServersField,
                #[serde(default)]
                metrics: Option<Vec<MetricKind>>,
                #[serde(default)]
                min_status: Option<ServerStatus>,
            }
            #[derive(Deserialize)]
            #[serde(untagged)]
            enum ServersField {
                All(AllMarker),
                List(Vec<ServerId>),
            }
            #[derive(Deserialize)]
            #[serde(rename_all = "lowercase")]
            enum AllMarker {
                All,
            }
            let data: Data = serde_json::from_value(envelope.data).map_err(|e| ProtocolDecodeError::BadData("SUBSCRIBE", e.to_string()))?;
            let servers = match data.servers {
                ServersField::All(_) => ServerSelector::All,
                ServersField::List(ids) => ServerSelector::Explicit(ids),
            };
            Ok(ClientMessage::Subscribe {
                servers,
                metrics: data.metrics,
                min_status: data.min_status,
            })
        }
        "UNSUBSCRIBE" => {
            #[derive(Deserialize, Default)]
            struct Data {
                #[serde(default)]
                servers: Vec<ServerId>,
            }
            let data: Data = serde_json::from_value(envelope.data).map_err(|e| ProtocolDecodeError::BadData("UNSUBSCRIBE", e.to_string()))?;
            Ok(ClientMessage::Unsubscribe { servers: data.servers })
        }
        "PING" => Ok(ClientMessage::Ping),
        "PONG" => Ok(ClientMessage::Pong),
        "REQUEST_HISTORY" => {
            #[derive(Deserialize)]
            struct Data {
                server: ServerId,
                metric: MetricKind,
                #[serde(default)]
                from_ms: i64,
                #[serde(default = "default_to_ms")]
                to_ms: i64,
            }
            fn default_to_ms() -> i64 {
                Utc::now().timestamp_millis()
            }
            let data: Data = serde_json::from_value(envelope.data).map_err(|e| ProtocolDecodeError::BadData("REQUEST_HISTORY", e.to_string()))?;
            Ok(ClientMessage::RequestHistory {
                server: data.server,
                metric: data.metric,
                from_ms: data.from_ms,
                to_ms: data.to_ms,
            })
        }
        other => Err(ProtocolDecodeError::UnknownType(other.to_string())),
    }
}

/// A message the server sends to a connected client, independent of the
/// envelope wrapper so `Batch` can nest already-built frames.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Hello { connection_id: String },
    Heartbeat,
    SubscribeAck {
        servers: ServerSelector,
        metrics: Option<Vec<MetricKind>>,
        min_status: Option<ServerStatus>,
    },
    Metrics(MetricsSample),
    StatusChange(WireThresholdEvent),
    History {
        server_id: ServerId,
        metric: MetricKind,
        samples: Vec<MetricsSample>,
        partial: bool,
    },
    Error { code: &'static str, message: String },
    Shutdown,
    Batch(Vec<Envelope>),
}

impl ServerMessage {
    /// Builds the wire envelope for this message, stamping the current
    /// wall-clock time.
    pub fn into_envelope(self) -> Envelope {
        let (kind, data) = match self {
            ServerMessage::Hello { connection_id } => ("HELLO", serde_json::json!({ "connection_id": connection_id })),
            ServerMessage::Heartbeat => ("PING", serde_json::json!({})),
            ServerMessage::SubscribeAck { servers, metrics, min_status } => (
                "SUBSCRIBE_ACK",
                serde_json::json!({
                    "servers": match servers {
                        ServerSelector::All => serde_json::json!("all"),
                        ServerSelector::Explicit(ids) => serde_json::json!(ids),
                    },
                    "metrics": metrics,
                    "min_status": min_status,
                }),
            ),
            ServerMessage::Metrics(sample) => ("METRICS", serde_json::to_value(sample).unwrap_or(Value::Null)),
            ServerMessage::StatusChange(event) => ("STATUS_CHANGE", serde_json::to_value(event).unwrap_or(Value::Null)),
            ServerMessage::History { server_id, metric, samples, partial } => (
                "HISTORY",
                serde_json::json!({
                    "server_id": server_id,
                    "metric": metric,
                    "samples": samples,
                    "partial": partial,
                }),
            ),
            ServerMessage::Error { code, message } => ("ERROR", serde_json::json!({ "code": code, "message": message })),
            ServerMessage::Shutdown => ("SHUTDOWN", serde_json::json!({})),
            ServerMessage::Batch(frames) => ("BATCH", serde_json::json!({ "messages": frames })),
        };
        Envelope::new(kind, data)
    }
}

/// A `STATUS_CHANGE` frame's `data` payload — either a [`ThresholdEvent`]
/// (one metric's debounced band crossing) or a [`StatusTransitionEvent`]
/// (the server's overall derived status changing, e.g. to/from `Offline`).
/// Both carry the server's `ServerStatus` before/after and a reason code
/// (spec §3 `ServerStatus`, §8 S3) in `status_from`/`status_to`/`reason`;
/// `metric`/`band_from`/`band_to`/`value` are only present for the former.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireThresholdEvent {
    pub server_id: ServerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub status_from: ServerStatus,
    pub status_to: ServerStatus,
    pub reason: String,
    pub timestamp_ms: i64,
}

impl From<ThresholdEvent> for WireThresholdEvent {
    fn from(event: ThresholdEvent) -> Self {
        let metric = event.metric.as_str().to_string();
        Self {
            server_id: event.server_id,
            status_from: status_for_band(event.from),
            status_to: status_for_band(event.to),
            reason: format!("{metric}_threshold"),
            metric: Some(metric),
            band_from: Some(band_str(event.from).to_string()),
            band_to: Some(band_str(event.to).to_string()),
            value: Some(event.value),
            timestamp_ms: event.timestamp_ms,
        }
    }
}

impl From<StatusTransitionEvent> for WireThresholdEvent {
    fn from(event: StatusTransitionEvent) -> Self {
        Self {
            server_id: event.server_id,
            metric: None,
            band_from: None,
            band_to: None,
            value: None,
            status_from: event.from,
            status_to: event.to,
            reason: event.reason,
            timestamp_ms: event.timestamp_ms,
        }
    }
}

impl From<PushEvent> for WireThresholdEvent {
    fn from(event: PushEvent) -> Self {
        match event {
            PushEvent::Metric(event) => event.into(),
            PushEvent::Status(event) => event.into(),
        }
    }
}

fn band_str(band: Band) -> &'static str {
    match band {
        Band::Normal => "normal",
        Band::Warning => "warning",
        Band::Critical => "critical",
    }
}

/// A metric band maps directly onto the `ServerStatus` it would produce in
/// isolation — used so per-metric `STATUS_CHANGE` frames carry a
/// `ServerStatus` alongside the band, not just the band itself.
fn status_for_band(band: Band) -> ServerStatus {
    match band {
        Band::Normal => ServerStatus::Online,
        Band::Warning => ServerStatus::Warning,
        Band::Critical => ServerStatus::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_all_decodes() {
        let text = r#"{"type":"SUBSCRIBE","ts":0,"data":{"servers":"all"}}"#;
        let msg = decode_client_message(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                servers: ServerSelector::All,
                metrics: None,
                min_status: None,
            }
        );
    }

    #[test]
    fn subscribe_explicit_servers_and_metrics_decodes() {
        let text = r#"{"type":"SUBSCRIBE","ts":0,"data":{"servers":["srv-1"],"metrics":["cpu","memory"]}}"#;
        let msg = decode_client_message(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                servers: ServerSelector::Explicit(vec![ServerId::from("srv-1")]),
                metrics: Some(vec![MetricKind::Cpu, MetricKind::Memory]),
                min_status: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_reported_distinctly() {
        let text = r#"{"type":"BOGUS","ts":0,"data":{}}"#;
        match decode_client_message(text) {
            Err(ProtocolDecodeError::UnknownType(t)) => assert_eq!(t, "BOGUS"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn hello_envelope_has_expected_type() {
        let envelope = ServerMessage::Hello { connection_id: "abc".into() }.into_envelope();
        assert_eq!(envelope.kind, "HELLO");
        assert_eq!(envelope.data["connection_id"], "abc");
    }

    #[test]
    fn threshold_event_wire_form_carries_band_and_status() {
        let event = ThresholdEvent {
            server_id: ServerId::from("srv-1"),
            metric: MetricKind::Cpu,
            from: Band::Normal,
            to: Band::Critical,
            value: 97.5,
            timestamp_ms: 1_000,
        };
        let wire: WireThresholdEvent = event.into();
        assert_eq!(wire.metric.as_deref(), Some("cpu"));
        assert_eq!(wire.band_from.as_deref(), Some("normal"));
        assert_eq!(wire.band_to.as_deref(), Some("critical"));
        assert_eq!(wire.status_from, ServerStatus::Online);
        assert_eq!(wire.status_to, ServerStatus::Critical);
        assert_eq!(wire.reason, "cpu_threshold");
    }

    #[test]
    fn status_transition_event_wire_form_has_no_band_fields() {
        let event = StatusTransitionEvent {
            server_id: ServerId::from("srv-1"),
            from: ServerStatus::Warning,
            to: ServerStatus::Offline,
            reason: "host_key_mismatch".to_string(),
            timestamp_ms: 2_000,
        };
        let wire: WireThresholdEvent = event.into();
        assert!(wire.metric.is_none());
        assert!(wire.band_from.is_none());
        assert!(wire.band_to.is_none());
        assert_eq!(wire.status_from, ServerStatus::Warning);
        assert_eq!(wire.status_to, ServerStatus::Offline);
        assert_eq!(wire.reason, "host_key_mismatch");
    }

    #[test]
    fn push_event_dispatches_to_the_right_conversion() {
        let metric_event = PushEvent::Metric(ThresholdEvent {
            server_id: ServerId::from("srv-1"),
            metric: MetricKind::Memory,
            from: Band::Critical,
            to: Band::Normal,
            value: 10.0,
            timestamp_ms: 3_000,
        });
        let wire: WireThresholdEvent = metric_event.into();
        assert_eq!(wire.metric.as_deref(), Some("memory"));

        let status_event = PushEvent::Status(StatusTransitionEvent {
            server_id: ServerId::from("srv-1"),
            from: ServerStatus::Offline,
            to: ServerStatus::Online,
            reason: "collection_recovered".to_string(),
            timestamp_ms: 4_000,
        });
        let wire: WireThresholdEvent = status_event.into();
        assert!(wire.metric.is_none());
        assert_eq!(wire.reason, "collection_recovered");
    }
}
