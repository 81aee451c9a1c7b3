//! The closed set of configuration keys the core reads.
//!
//! Loading these values from a file or environment is the adapter's concern;
//! this module only owns the typed representation, its defaults, and basic
//! validation. Unknown keys are rejected at deserialization time so the set
//! stays closed as new keys are added deliberately rather than accidentally.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::MetricKind;

/// Per-command timeout overrides, keyed by the command's registry key
/// (`cpu`, `memory`, `disk`, `network`, `sysinfo`, `uptime`, `load`).
pub type CommandTimeouts = HashMap<String, u64>;

/// Warning/critical bands and debounce count for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDefaults {
    pub warning: f64,
    pub critical: f64,
    pub debounce_samples: u32,
}

impl ThresholdDefaults {
    const fn new(warning: f64, critical: f64, debounce_samples: u32) -> Self {
        Self {
            warning,
            critical,
            debounce_samples,
        }
    }
}

/// Top-level configuration, deserialized from the adapter-owned config file.
///
/// `#[serde(deny_unknown_fields)]` keeps the key set closed: a typo or a
/// speculative new key fails loudly at startup instead of being silently
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub collection_period_s: u64,
    pub command_timeout_s: CommandTimeouts,
    pub ssh_connect_timeout_s: u64,
    pub ssh_max_per_server: u8,
    pub ssh_idle_ttl_s: u64,
    pub sample_ring_capacity: usize,
    pub sink_batch_size: usize,
    pub sink_batch_flush_ms: u64,
    pub heartbeat_interval_s: u64,
    pub heartbeat_timeout_misses: u32,
    pub ws_send_queue: usize,
    pub ws_max_connections: usize,
    pub ws_max_per_ip: usize,
    pub ws_max_message_bytes: usize,
    pub threshold_defaults: HashMap<MetricKind, ThresholdDefaults>,
    /// Not persisted in the config file in practice (sourced from a secret
    /// store by the adapter), but present in the struct so the closed key
    /// set in spec §6 is complete. `None` means "no master key configured",
    /// which the Vault surfaces as `VaultError::MasterKeyMissing`.
    #[serde(skip)]
    pub master_key: Option<[u8; 32]>,
    pub known_hosts_path: String,
    pub allow_tofu: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut threshold_defaults = HashMap::new();
        threshold_defaults.insert(MetricKind::Cpu, ThresholdDefaults::new(80.0, 95.0, 3));
        threshold_defaults.insert(MetricKind::Memory, ThresholdDefaults::new(85.0, 95.0, 3));
        threshold_defaults.insert(MetricKind::Disk, ThresholdDefaults::new(85.0, 95.0, 3));
        threshold_defaults.insert(MetricKind::Network, ThresholdDefaults::new(80.0, 95.0, 3));

        Self {
            collection_period_s: 30,
            command_timeout_s: CommandTimeouts::new(),
            ssh_connect_timeout_s: 10,
            ssh_max_per_server: 3,
            ssh_idle_ttl_s: 5 * 60,
            sample_ring_capacity: 240,
            sink_batch_size: 64,
            sink_batch_flush_ms: 5_000,
            heartbeat_interval_s: 30,
            heartbeat_timeout_misses: 2,
            ws_send_queue: 64,
            ws_max_connections: 1000,
            ws_max_per_ip: 10,
            ws_max_message_bytes: 16 * 1024,
            threshold_defaults,
            master_key: None,
            known_hosts_path: String::from("~/.cwatcher/known_hosts"),
            allow_tofu: false,
        }
    }
}

impl Config {
    /// Validates ranges the spec documents explicitly; returns a description
    /// of the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if !(10..=300).contains(&self.collection_period_s) {
            return Err(format!(
                "collection_period_s must be 10..=300, got {}",
                self.collection_period_s
            ));
        }
        if !(1..=8).contains(&self.ssh_max_per_server) {
            return Err(format!(
                "ssh_max_per_server must be 1..=8, got {}",
                self.ssh_max_per_server
            ));
        }
        Ok(())
    }

    pub fn collection_period(&self) -> Duration {
        Duration::from_secs(self.collection_period_s)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_s)
    }

    pub fn ssh_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.ssh_idle_ttl_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn sink_batch_flush(&self) -> Duration {
        Duration::from_millis(self.sink_batch_flush_ms)
    }

    /// Per-command timeout, falling back to the documented defaults (5-10s)
    /// when the operator hasn't overridden it.
    pub fn command_timeout(&self, key: &str) -> Duration {
        let default_secs = match key {
            "cpu" | "memory" | "load" => 5,
            "disk" | "network" | "uptime" => 8,
            "sysinfo" => 10,
            _ => 10,
        };
        let secs = self
            .command_timeout_s
            .get(key)
            .copied()
            .unwrap_or(default_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.collection_period_s, 30);
        assert_eq!(cfg.ssh_max_per_server, 3);
        assert_eq!(cfg.sample_ring_capacity, 240);
        assert_eq!(cfg.ws_send_queue, 64);
        assert!(!cfg.allow_tofu);
    }

    #[test]
    fn validate_rejects_out_of_range_period() {
        let mut cfg = Config::default();
        cfg.collection_period_s = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_pool_size() {
        let mut cfg = Config::default();
        cfg.ssh_max_per_server = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let json = r#"{"collection_period_s": 30, "bogus_key": 1}"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
