//! Per-server periodic collection loop.
//!
//! Grounded on the teacher's `SshConnectionManager` worker model — one
//! long-lived `tokio::spawn` per unit of work, draining input until told to
//! stop — generalized from "one worker per cached connection" to "one
//! worker per monitored server, waking on a fixed period instead of a
//! channel."

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CommandError, PoolError};
use crate::models::{MetricsSample, ServerStatus, SystemInfo};
use crate::ssh::pool::ServerConnectInfo;
use crate::ssh::SshPool;
use crate::store::Store;
use crate::threshold::{PushEvent, StatusTransitionEvent, ThresholdEvaluator};

use super::executor::Executor;
use super::parsers::{self, PrevSampleState};
use super::registry::{CommandKey, CommandTimeouts};

/// Refresh cadence for the slow-changing [`SystemInfo`] probe, independent
/// of the per-metric collection period.
const SYSINFO_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// Consecutive all-metrics-missing cycles required before a server is
/// confirmed `Offline`, so one transient blip doesn't flap its status
/// (spec §4.6: "its own debounce (default 2)").
const OFFLINE_DEBOUNCE_CYCLES: u32 = 2;

/// Drives periodic collection for every registered server. Owns the shared
/// Pool/Store/Evaluator; per-server state (sequence counters, previous
/// samples for delta metrics) lives in each spawned task.
pub struct Scheduler {
    pool: Arc<SshPool>,
    store: Arc<Store>,
    evaluator: Arc<ThresholdEvaluator>,
    publisher: broadcast::Sender<Arc<MetricsSample>>,
    event_publisher: broadcast::Sender<Arc<PushEvent>>,
    cycle_period: Duration,
    acquire_timeout: Duration,
    command_timeouts: CommandTimeouts,
    command_workers: Arc<Semaphore>,
}

/// A handle to one running server's collection loop.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests cooperative shutdown; does not block on completion.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

impl Scheduler {
    pub fn new(
        pool: Arc<SshPool>,
        store: Arc<Store>,
        evaluator: Arc<ThresholdEvaluator>,
        publisher: broadcast::Sender<Arc<MetricsSample>>,
        event_publisher: broadcast::Sender<Arc<PushEvent>>,
        cycle_period: Duration,
        acquire_timeout: Duration,
        command_timeouts: CommandTimeouts,
        command_workers: Arc<Semaphore>,
    ) -> Self {
        Self {
            pool,
            store,
            evaluator,
            publisher,
            event_publisher,
            cycle_period,
            acquire_timeout,
            command_timeouts,
            command_workers,
        }
    }

    /// Spawns the collection loop for one server. The caller holds the
    /// returned handle and is responsible for calling `shutdown` (and
    /// awaiting `join`) when the server is removed or the process stops.
    pub fn spawn_server(&self, info: ServerConnectInfo, parent_cancel: &CancellationToken) -> SchedulerHandle {
        let cancel = parent_cancel.child_token();
        let pool = self.pool.clone();
        let store = self.store.clone();
        let evaluator = self.evaluator.clone();
        let publisher = self.publisher.clone();
        let event_publisher = self.event_publisher.clone();
        let cycle_period = self.cycle_period;
        let acquire_timeout = self.acquire_timeout;
        let command_timeouts = self.command_timeouts;
        let command_workers = self.command_workers.clone();
        let loop_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            run_server_loop(
                pool,
                store,
                evaluator,
                publisher,
                event_publisher,
                info,
                cycle_period,
                acquire_timeout,
                command_timeouts,
                command_workers,
                loop_cancel,
            )
            .await;
        });

        SchedulerHandle { cancel, join }
    }
}

async fn run_server_loop(
    pool: Arc<SshPool>,
    store: Arc<Store>,
    evaluator: Arc<ThresholdEvaluator>,
    publisher: broadcast::Sender<Arc<MetricsSample>>,
    event_publisher: broadcast::Sender<Arc<PushEvent>>,
    info: ServerConnectInfo,
    cycle_period: Duration,
    acquire_timeout: Duration,
    command_timeouts: CommandTimeouts,
    command_workers: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let executor = Executor::new(&pool, command_workers);
    let mut prev = PrevSampleState::default();
    let seq = AtomicU64::new(0);
    let mut sysinfo_refreshed_at: Option<Instant> = None;
    let mut next_tick = Instant::now();
    let mut consecutive_failures: u32 = 0;
    let mut prev_status = ServerStatus::Unknown;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("collection loop for {} cancelled", info.server_id);
                return;
            }
            _ = tokio::time::sleep_until(next_tick.into()) => {}
        }
        next_tick += cycle_period;

        let cycle_start_ms = chrono::Utc::now().timestamp_millis();
        let cycle_budget = cycle_period.saturating_sub(Duration::from_secs(1));

        let refresh_sysinfo = sysinfo_refreshed_at.map(|at| at.elapsed() >= SYSINFO_REFRESH).unwrap_or(true);

        let cycle = tokio::time::timeout(
            cycle_budget,
            run_one_cycle(&executor, &info, &mut prev, refresh_sysinfo, acquire_timeout, &command_timeouts),
        )
        .await;

        let outcome = match cycle {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("{} collection cycle exceeded budget of {:?}", info.server_id, cycle_budget);
                CycleOutcome::default_missing()
            }
        };

        if let Some(system_info) = outcome.sysinfo {
            store.set_system_info(info.server_id.clone(), system_info);
            sysinfo_refreshed_at = Some(Instant::now());
        }

        let mut sample = MetricsSample {
            server_id: info_server_id(&info),
            timestamp_ms: cycle_start_ms,
            seq: seq.fetch_add(1, Ordering::SeqCst) + 1,
            cpu: outcome.cpu,
            memory: outcome.memory,
            disk: outcome.disk,
            network: outcome.network,
            status: ServerStatus::Unknown,
        };

        let all_missing = sample.cpu.missing && sample.memory.missing && sample.disk.missing && sample.network.missing;
        consecutive_failures = if all_missing { consecutive_failures + 1 } else { 0 };

        let (evaluated_status, events) = evaluator.evaluate(&sample);

        // A collection failure is only an "offline candidate" until it has
        // persisted for `OFFLINE_DEBOUNCE_CYCLES` consecutive cycles (spec
        // §4.6); until then the server keeps reporting its last confirmed
        // status rather than flapping to `Unknown` on a single missed cycle.
        sample.status = resolve_status(consecutive_failures, all_missing, evaluated_status, prev_status);

        for event in events {
            debug!(
                "{} {} band {:?} -> {:?} (value {:.1})",
                sample.server_id, event.metric, event.from, event.to, event.value
            );
            let _ = event_publisher.send(Arc::new(PushEvent::Metric(event)));
        }

        if sample.status != prev_status {
            let reason = if sample.status == ServerStatus::Offline {
                outcome.failure_reason.unwrap_or("collection_failed")
            } else if prev_status == ServerStatus::Offline {
                "collection_recovered"
            } else {
                "threshold_breach"
            };
            debug!("{} status {:?} -> {:?} ({reason})", sample.server_id, prev_status, sample.status);
            let _ = event_publisher.send(Arc::new(PushEvent::Status(StatusTransitionEvent {
                server_id: sample.server_id.clone(),
                from: prev_status,
                to: sample.status,
                reason: reason.to_string(),
                timestamp_ms: sample.timestamp_ms,
            })));
            prev_status = sample.status;
        }

        if let Err(err) = store.submit(sample.clone()).await {
            warn!("{} sample rejected by store: {err}", sample.server_id);
            continue;
        }

        let _ = publisher.send(Arc::new(sample));

        // The cycle budget already bounds `run_one_cycle` below `cycle_period`, but
        // submit/publish can still push us past the next scheduled tick under load.
        // Rather than fire back-to-back cycles to catch up, skip the missed tick.
        let now = Instant::now();
        if next_tick <= now {
            warn!("{} collection cycle ran long; skipping the next scheduled tick", info.server_id);
            next_tick = now + cycle_period;
        }
    }
}

fn info_server_id(info: &ServerConnectInfo) -> crate::models::ServerId {
    info.server_id.clone()
}

/// Decides this cycle's reported `ServerStatus` from the threshold
/// evaluator's verdict and the consecutive-failure counter (spec §4.6): a
/// collection failure only becomes `Offline` after `OFFLINE_DEBOUNCE_CYCLES`
/// consecutive all-missing cycles; until then the server holds its last
/// confirmed status instead of flapping to `Unknown` on a single bad cycle.
fn resolve_status(consecutive_failures: u32, all_missing: bool, evaluated_status: ServerStatus, prev_status: ServerStatus) -> ServerStatus {
    if consecutive_failures >= OFFLINE_DEBOUNCE_CYCLES {
        ServerStatus::Offline
    } else if all_missing {
        prev_status
    } else {
        evaluated_status
    }
}

#[derive(Default)]
struct CycleOutcome {
    cpu: crate::models::CpuRecord,
    memory: crate::models::MemoryRecord,
    disk: crate::models::DiskRecord,
    network: crate::models::NetworkRecord,
    sysinfo: Option<SystemInfo>,
    /// Machine-readable cause of the most specific core-command failure this
    /// cycle (`None` if every core command succeeded), used to give an
    /// offline transition a reason better than a generic one (spec §7, §8 S3).
    failure_reason: Option<&'static str>,
}

impl CycleOutcome {
    fn default_missing() -> Self {
        Self {
            cpu: crate::models::CpuRecord { missing: true, ..Default::default() },
            memory: crate::models::MemoryRecord { missing: true, ..Default::default() },
            disk: crate::models::DiskRecord { missing: true, ..Default::default() },
            network: crate::models::NetworkRecord { missing: true, ..Default::default() },
            sysinfo: None,
            failure_reason: Some("cycle_timeout"),
        }
    }
}

/// Maps a core command's failure to a machine-readable reason code, ranked
/// so the most specific/severe cause wins when several commands fail in the
/// same cycle (e.g. a host-key mismatch always explains the cycle better
/// than a generic command timeout on another metric).
fn failure_reason_for(err: &CommandError) -> &'static str {
    match err {
        CommandError::CommandTimeout(_) => "command_timeout",
        CommandError::CommandFailed { .. } => "command_failed",
        CommandError::Pool(PoolError::HostKeyMismatch(_)) => "host_key_mismatch",
        CommandError::Pool(PoolError::AuthFailed(_)) => "auth_failed",
        CommandError::Pool(PoolError::CredentialError(_, _)) => "credential_error",
        CommandError::Pool(PoolError::ConnectFailed(_)) => "connect_failed",
        CommandError::Pool(PoolError::HandshakeFailed(_)) => "connect_failed",
        CommandError::Pool(PoolError::SessionLost(_)) => "session_lost",
        CommandError::Pool(PoolError::PoolExhausted(_)) => "pool_exhausted",
        CommandError::Pool(PoolError::Ssh2Error(_)) => "connect_failed",
        CommandError::Pool(PoolError::RusshError(_)) => "connect_failed",
    }
}

fn reason_priority(reason: &str) -> u8 {
    match reason {
        "host_key_mismatch" => 6,
        "auth_failed" | "credential_error" => 5,
        "connect_failed" => 4,
        "session_lost" | "pool_exhausted" => 3,
        "command_timeout" | "cycle_timeout" => 2,
        "command_failed" => 1,
        _ => 0,
    }
}

/// Keeps the higher-priority of two candidate failure reasons seen so far
/// this cycle.
fn merge_failure_reason(current: Option<&'static str>, candidate: &'static str) -> Option<&'static str> {
    match current {
        Some(existing) if reason_priority(existing) >= reason_priority(candidate) => Some(existing),
        _ => Some(candidate),
    }
}

/// Runs every per-cycle command concurrently and assembles their parsed
/// results. A single command's failure only affects that metric's record —
/// it never aborts the other three.
async fn run_one_cycle(
    executor: &Executor<'_>,
    info: &ServerConnectInfo,
    prev: &mut PrevSampleState,
    refresh_sysinfo: bool,
    acquire_timeout: Duration,
    command_timeouts: &CommandTimeouts,
) -> CycleOutcome {
    let (cpu_res, mem_res, disk_res, net_res, load_res) = tokio::join!(
        executor.execute(info, CommandKey::Cpu, Some(command_timeouts.get(CommandKey::Cpu)), acquire_timeout),
        executor.execute(info, CommandKey::Memory, Some(command_timeouts.get(CommandKey::Memory)), acquire_timeout),
        executor.execute(info, CommandKey::Disk, Some(command_timeouts.get(CommandKey::Disk)), acquire_timeout),
        executor.execute(info, CommandKey::Network, Some(command_timeouts.get(CommandKey::Network)), acquire_timeout),
        executor.execute(info, CommandKey::Load, Some(command_timeouts.get(CommandKey::Load)), acquire_timeout),
    );

    let mut failure_reason: Option<&'static str> = None;

    let mut cpu = match cpu_res {
        Ok(raw) => {
            let (record, warnings) = parsers::parse_cpu(&raw, &mut prev.cpu_ticks);
            log_warnings(&info.server_id, "cpu", &warnings);
            record
        }
        Err(err) => {
            debug!("{} cpu command failed: {err}", info.server_id);
            failure_reason = merge_failure_reason(failure_reason, failure_reason_for(&err));
            crate::models::CpuRecord { missing: true, ..Default::default() }
        }
    };

    if let Ok(raw) = &load_res {
        let (load, warnings) = parsers::parse_load(raw);
        log_warnings(&info.server_id, "load", &warnings);
        if let Some((l1, l5, l15)) = load {
            cpu.load_1m = Some(l1);
            cpu.load_5m = Some(l5);
            cpu.load_15m = Some(l15);
        }
    }

    let memory = match mem_res {
        Ok(raw) => {
            let (record, warnings) = parsers::parse_memory(&raw);
            log_warnings(&info.server_id, "memory", &warnings);
            record
        }
        Err(err) => {
            debug!("{} memory command failed: {err}", info.server_id);
            failure_reason = merge_failure_reason(failure_reason, failure_reason_for(&err));
            crate::models::MemoryRecord { missing: true, ..Default::default() }
        }
    };

    let disk = match disk_res {
        Ok(raw) => {
            let (record, warnings) = parsers::parse_disk(&raw);
            log_warnings(&info.server_id, "disk", &warnings);
            record
        }
        Err(err) => {
            debug!("{} disk command failed: {err}", info.server_id);
            failure_reason = merge_failure_reason(failure_reason, failure_reason_for(&err));
            crate::models::DiskRecord { missing: true, ..Default::default() }
        }
    };

    let network = match net_res {
        Ok(raw) => {
            let (record, warnings) = parsers::parse_network(&raw, &mut prev.net_counters, &mut prev.net_sampled_at);
            log_warnings(&info.server_id, "network", &warnings);
            record
        }
        Err(err) => {
            debug!("{} network command failed: {err}", info.server_id);
            failure_reason = merge_failure_reason(failure_reason, failure_reason_for(&err));
            crate::models::NetworkRecord { missing: true, ..Default::default() }
        }
    };

    let sysinfo = if refresh_sysinfo {
        match executor
            .execute(info, CommandKey::SysInfo, Some(command_timeouts.get(CommandKey::SysInfo)), acquire_timeout)
            .await
        {
            Ok(raw) => {
                let (record, warnings) = parsers::parse_sysinfo(&raw);
                log_warnings(&info.server_id, "sysinfo", &warnings);
                Some(record)
            }
            Err(err) => {
                debug!("{} sysinfo command failed: {err}", info.server_id);
                None
            }
        }
    } else {
        None
    };

    CycleOutcome { cpu, memory, disk, network, sysinfo, failure_reason }
}

fn log_warnings(server_id: &crate::models::ServerId, metric: &str, warnings: &[crate::error::ParseWarning]) {
    for warning in warnings {
        debug!("{server_id} {metric} parse warning [{}]: {}", warning.field, warning.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_refresh_cadence_is_daily() {
        assert_eq!(SYSINFO_REFRESH, Duration::from_secs(86_400));
    }

    #[test]
    fn single_failed_cycle_holds_prior_status_instead_of_offline() {
        let status = resolve_status(1, true, ServerStatus::Unknown, ServerStatus::Online);
        assert_eq!(status, ServerStatus::Online);
    }

    #[test]
    fn two_consecutive_failed_cycles_go_offline() {
        let status = resolve_status(OFFLINE_DEBOUNCE_CYCLES, true, ServerStatus::Unknown, ServerStatus::Warning);
        assert_eq!(status, ServerStatus::Offline);
    }

    #[test]
    fn persistent_offline_overrides_prior_band() {
        // A server that was Critical, then goes fully unreachable for two
        // cycles, reports Offline rather than holding onto Critical.
        let status = resolve_status(OFFLINE_DEBOUNCE_CYCLES + 1, true, ServerStatus::Unknown, ServerStatus::Critical);
        assert_eq!(status, ServerStatus::Offline);
    }

    #[test]
    fn successful_cycle_uses_evaluated_status_and_resets() {
        let status = resolve_status(0, false, ServerStatus::Warning, ServerStatus::Offline);
        assert_eq!(status, ServerStatus::Warning);
    }

    #[test]
    fn failure_reason_prefers_host_key_mismatch_over_timeout() {
        let merged = merge_failure_reason(Some("command_timeout"), "host_key_mismatch");
        assert_eq!(merged, Some("host_key_mismatch"));
    }

    #[test]
    fn failure_reason_keeps_higher_priority_when_seen_first() {
        let merged = merge_failure_reason(Some("host_key_mismatch"), "command_failed");
        assert_eq!(merged, Some("host_key_mismatch"));
    }

    #[test]
    fn failure_reason_for_maps_pool_errors() {
        assert_eq!(failure_reason_for(&CommandError::Pool(PoolError::HostKeyMismatch("srv-1".into()))), "host_key_mismatch");
        assert_eq!(failure_reason_for(&CommandError::Pool(PoolError::AuthFailed("srv-1".into()))), "auth_failed");
    }
}
