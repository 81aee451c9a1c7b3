//! Shared data model: the entities from the spec's data-model table.
//!
//! Types here are plain data; behavior lives in the owning component module
//! (`vault`, `ssh`, `collector`, `store`, `threshold`, `push`).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a registered target host.
///
/// Accepts either a UUID or an operator-chosen slug — the spec requires only
/// that it be stable, not that it take a particular shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier for one accepted WebSocket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How a server's credential is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
}

/// A registered target host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub secret: crate::vault::EncryptedSecret,
    pub tags: Vec<String>,
    pub monitoring_enabled: bool,
    /// Soft-delete marker; a deleted server is excluded from scheduling but
    /// its historical samples remain queryable.
    pub deleted: bool,
}

/// The four collected metric kinds plus the static system-facts record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::Disk,
        MetricKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::Disk => "disk",
            MetricKind::Network => "network",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU utilization record. `usage_percent` is omitted (`None`) on the first
/// sample for a server since busy-ratio requires two consecutive reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuRecord {
    pub usage_percent: Option<f64>,
    pub cores: Option<u32>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    /// `true` when this is the first sample for the server and busy-ratio
    /// could not yet be computed from a delta.
    pub warmup: bool,
    pub missing: bool,
}

/// Memory utilization record, all values in bytes except the percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub usage_percent: Option<f64>,
    pub swap_total_bytes: Option<u64>,
    pub swap_used_bytes: Option<u64>,
    pub missing: bool,
}

/// One mounted partition's disk usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskPartition {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
}

/// Disk utilization record, one entry per mounted partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub partitions: Vec<DiskPartition>,
    pub missing: bool,
}

/// One network interface's instantaneous throughput, derived from counter
/// deltas against the previous sample (never an instantaneous rate read
/// straight from the kernel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub rx_bps: f64,
    pub tx_bps: f64,
}

/// Network utilization record, one entry per interface. Empty and
/// `warmup = true` on the first sample for a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub interfaces: Vec<NetworkInterface>,
    pub warmup: bool,
    pub missing: bool,
}

/// Slow-changing host facts, refreshed on first connect and daily.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub total_ram_bytes: Option<u64>,
    pub interfaces: Vec<String>,
}

/// Derived health for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Warning,
    Critical,
    Offline,
    Unknown,
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus::Unknown
    }
}

/// One complete collection cycle's result for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub server_id: ServerId,
    /// Wall-clock timestamp at cycle *start*, milliseconds since epoch.
    pub timestamp_ms: i64,
    /// Monotonically increasing per-server sequence number.
    pub seq: u64,
    pub cpu: CpuRecord,
    pub memory: MemoryRecord,
    pub disk: DiskRecord,
    pub network: NetworkRecord,
    pub status: ServerStatus,
}

impl MetricsSample {
    pub fn metric_missing(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Cpu => self.cpu.missing,
            MetricKind::Memory => self.memory.missing,
            MetricKind::Disk => self.disk.missing,
            MetricKind::Network => self.network.missing,
        }
    }
}
