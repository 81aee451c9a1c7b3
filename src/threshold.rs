//! Threshold Evaluator: pure mapping from a sample's metric values to a
//! derived [`ServerStatus`], with debounced band transitions so a single
//! noisy sample doesn't flip a server's status back and forth.
//!
//! Percent-based metrics (CPU, memory, disk) are evaluated against the
//! configured warning/critical bands. Network is intentionally excluded —
//! its unit is bytes/sec, not a bounded percentage, and the spec gives no
//! per-interface baseline to threshold against; its `threshold_defaults`
//! entry exists for forward compatibility but is not evaluated today.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::config::ThresholdDefaults;
use crate::models::{MetricKind, MetricsSample, ServerId, ServerStatus};

/// A metric's position relative to its configured bands.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    #[default]
    Normal,
    Warning,
    Critical,
}

/// Emitted whenever a metric's debounced band changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEvent {
    pub server_id: ServerId,
    pub metric: MetricKind,
    pub from: Band,
    pub to: Band,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Emitted whenever a server's overall `ServerStatus` changes — including a
/// transition to or from `Offline` driven by collection failures, which has
/// no single metric band to report (spec §3 `ServerStatus`, §8 S3). Distinct
/// from [`ThresholdEvent`], which reports one metric's band crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransitionEvent {
    pub server_id: ServerId,
    pub from: ServerStatus,
    pub to: ServerStatus,
    /// Machine-readable cause, e.g. `host_key_mismatch`, `auth_failed`,
    /// `collection_failed`, `collection_recovered`, `threshold_breach`.
    pub reason: String,
    pub timestamp_ms: i64,
}

/// Everything the Push Fabric forwards to subscribers as a `STATUS_CHANGE`
/// frame: either one metric's debounced band crossing, or the server's
/// overall derived status changing.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Metric(ThresholdEvent),
    Status(StatusTransitionEvent),
}

impl PushEvent {
    pub fn server_id(&self) -> &ServerId {
        match self {
            PushEvent::Metric(event) => &event.server_id,
            PushEvent::Status(event) => &event.server_id,
        }
    }
}

#[derive(Default)]
struct DebounceState {
    consecutive_breaches: u32,
    confirmed: Band,
}

/// Stateful evaluator: holds per-(server, metric) debounce counters across
/// calls to [`Self::evaluate`]. Safe to share across the Scheduler's
/// concurrent per-server tasks.
pub struct ThresholdEvaluator {
    defaults: HashMap<MetricKind, ThresholdDefaults>,
    state: DashMap<(ServerId, MetricKind), DebounceState>,
}

impl ThresholdEvaluator {
    pub fn new(defaults: HashMap<MetricKind, ThresholdDefaults>) -> Self {
        Self {
            defaults,
            state: DashMap::new(),
        }
    }

    /// Evaluates one sample, returning the worst-band-wins overall status
    /// and any threshold events raised by a debounced band change.
    pub fn evaluate(&self, sample: &MetricsSample) -> (ServerStatus, Vec<ThresholdEvent>) {
        let mut events = Vec::new();
        let mut worst = None;

        for (metric, value) in self.evaluable_values(sample) {
            let Some(defaults) = self.defaults.get(&metric) else { continue };
            let instantaneous = band_for(value, defaults);

            let mut entry = self.state.entry((sample.server_id.clone(), metric)).or_default();
            let confirmed = confirm_band(&mut entry, instantaneous, defaults.debounce_samples);

            if confirmed != entry.confirmed {
                events.push(ThresholdEvent {
                    server_id: sample.server_id.clone(),
                    metric,
                    from: entry.confirmed,
                    to: confirmed,
                    value,
                    timestamp_ms: sample.timestamp_ms,
                });
                entry.confirmed = confirmed;
            }

            worst = Some(worst.map_or(confirmed, |w: Band| w.max(confirmed)));
        }

        let status = match worst {
            Some(Band::Normal) => ServerStatus::Online,
            Some(Band::Warning) => ServerStatus::Warning,
            Some(Band::Critical) => ServerStatus::Critical,
            None => ServerStatus::Unknown,
        };

        (status, events)
    }

    fn evaluable_values(&self, sample: &MetricsSample) -> Vec<(MetricKind, f64)> {
        let mut values = Vec::new();
        if !sample.cpu.missing {
            if let Some(usage) = sample.cpu.usage_percent {
                values.push((MetricKind::Cpu, usage));
            }
        }
        if !sample.memory.missing {
            if let Some(usage) = sample.memory.usage_percent {
                values.push((MetricKind::Memory, usage));
            }
        }
        if !sample.disk.missing {
            if let Some(max_usage) = sample
                .disk
                .partitions
                .iter()
                .map(|p| p.usage_percent)
                .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
            {
                values.push((MetricKind::Disk, max_usage));
            }
        }
        values
    }

    pub fn forget_server(&self, server_id: &ServerId) {
        self.state.retain(|(id, _), _| id != server_id);
    }
}

fn band_for(value: f64, defaults: &ThresholdDefaults) -> Band {
    if value >= defaults.critical {
        Band::Critical
    } else if value >= defaults.warning {
        Band::Warning
    } else {
        Band::Normal
    }
}

/// Escalation (Normal → Warning → Critical) requires `debounce_samples`
/// consecutive readings in the new band before it's confirmed. De-escalation
/// is immediate on the first sample back under the prior band — a server
/// recovering shouldn't keep alerting while debounce counts down.
fn confirm_band(state: &mut DebounceState, instantaneous: Band, debounce_samples: u32) -> Band {
    if instantaneous >= state.confirmed {
        if instantaneous == state.confirmed {
            state.consecutive_breaches = 0;
            state.confirmed
        } else {
            state.consecutive_breaches += 1;
            if state.consecutive_breaches >= debounce_samples.max(1) {
                state.consecutive_breaches = 0;
                instantaneous
            } else {
                state.confirmed
            }
        }
    } else {
        state.consecutive_breaches = 0;
        instantaneous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuRecord, DiskRecord, MemoryRecord, NetworkRecord};

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
        map.insert(
            MetricKind::Memory,
            ThresholdDefaults {
                warning: 85.0,
                critical: 95.0,
                debounce_samples: 3,
            },
        );
        map.insert(
            MetricKind::Disk,
            ThresholdDefaults {
                warning: 85.0,
                critical: 95.0,
                debounce_samples: 3,
            },
        );
        map
    }

    fn sample_with_cpu(server_id: &str, usage: f64, seq: u64) -> MetricsSample {
        MetricsSample {
            server_id: ServerId::from(server_id),
            timestamp_ms: seq as i64 * 1000,
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

    #[test]
    fn single_breach_does_not_escalate_before_debounce_count() {
        let evaluator = ThresholdEvaluator::new(defaults());
        let (status, events) = evaluator.evaluate(&sample_with_cpu("srv-1", 90.0, 1));
        assert_eq!(status, ServerStatus::Online);
        assert!(events.is_empty());
    }

    #[test]
    fn three_consecutive_breaches_escalate_to_warning() {
        let evaluator = ThresholdEvaluator::new(defaults());
        for seq in 1..3 {
            evaluator.evaluate(&sample_with_cpu("srv-1", 90.0, seq));
        }
        let (status, events) = evaluator.evaluate(&sample_with_cpu("srv-1", 90.0, 3));
        assert_eq!(status, ServerStatus::Warning);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to, Band::Warning);
    }

    #[test]
    fn de_escalation_is_immediate() {
        let evaluator = ThresholdEvaluator::new(defaults());
        for seq in 1..=3 {
            evaluator.evaluate(&sample_with_cpu("srv-1", 90.0, seq));
        }
        let (status, events) = evaluator.evaluate(&sample_with_cpu("srv-1", 10.0, 4));
        assert_eq!(status, ServerStatus::Online);
        assert_eq!(events[0].to, Band::Normal);
    }

    #[test]
    fn worst_band_across_metrics_wins() {
        let evaluator = ThresholdEvaluator::new(defaults());
        let mut sample = sample_with_cpu("srv-1", 10.0, 1);
        sample.memory = MemoryRecord {
            usage_percent: Some(99.0),
            ..Default::default()
        };
        // memory needs 3 consecutive samples too, so drive it there directly
        // by calling evaluate three times with the same shape.
        let (_, _) = evaluator.evaluate(&sample);
        let (_, _) = evaluator.evaluate(&sample);
        let (status, _) = evaluator.evaluate(&sample);
        assert_eq!(status, ServerStatus::Critical);
    }
}
