//! Pure parsing functions: raw command stdout → typed metric records.
//!
//! Grounded on the teacher's `device.rs` discipline of never panicking on
//! untrusted device output — tokens that don't match the expected shape
//! become a [`ParseWarning`] and leave the affected field `missing`, they
//! never `unwrap()` into a crash.

use std::collections::HashMap;

use crate::error::ParseWarning;
use crate::models::{CpuRecord, DiskPartition, DiskRecord, MemoryRecord, NetworkInterface, NetworkRecord, SystemInfo};
use crate::ssh::session::RawOutput;

/// Per-server state carried across collection cycles by the Scheduler (not
/// a global) so CPU busy-ratio and network byte-rates can be computed as
/// deltas rather than instantaneous kernel counters.
#[derive(Debug, Clone, Default)]
pub struct PrevSampleState {
    pub cpu_ticks: Option<CpuTicks>,
    pub net_counters: HashMap<String, (u64, u64)>,
    pub net_sampled_at: Option<std::time::Instant>,
}

/// The four busy/idle counters from one `/proc/stat` read, summed across
/// all fields that count as "busy" vs. the `idle` + `iowait` fields.
#[derive(Debug, Clone, Copy)]
pub struct CpuTicks {
    pub idle: u64,
    pub total: u64,
}

/// Parses `cat /proc/stat` output into CPU busy-ratio, comparing against the
/// previous sample's ticks. The very first sample for a server has no prior
/// ticks to diff against, so `usage_percent` stays `None` and `warmup` is
/// set (spec §4.3).
pub fn parse_cpu(raw: &RawOutput, prev: &mut Option<CpuTicks>) -> (CpuRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();

    if raw.exit != 0 || raw.stdout.trim().is_empty() {
        warnings.push(ParseWarning::new("cpu", "no output from /proc/stat"));
        return (
            CpuRecord {
                missing: true,
                ..Default::default()
            },
            warnings,
        );
    }

    let Some(line) = raw.stdout.lines().find(|l| l.starts_with("cpu ")) else {
        warnings.push(ParseWarning::new("cpu", "no aggregate 'cpu' line found"));
        return (
            CpuRecord {
                missing: true,
                ..Default::default()
            },
            warnings,
        );
    };

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|tok| tok.parse::<u64>().ok())
        .collect();

    if fields.len() < 4 {
        warnings.push(ParseWarning::new("cpu", "fewer than 4 numeric fields on cpu line"));
        return (
            CpuRecord {
                missing: true,
                ..Default::default()
            },
            warnings,
        );
    }

    // user, nice, system, idle, iowait, irq, softirq, steal (RFC: /proc/stat)
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    let ticks = CpuTicks { idle, total };

    let (usage_percent, warmup) = match prev {
        Some(prev_ticks) => {
            let total_delta = total.saturating_sub(prev_ticks.total);
            let idle_delta = idle.saturating_sub(prev_ticks.idle);
            if total_delta == 0 {
                (None, false)
            } else {
                let busy_delta = total_delta.saturating_sub(idle_delta);
                let pct = (busy_delta as f64 / total_delta as f64) * 100.0;
                (Some(pct.clamp(0.0, 100.0)), false)
            }
        }
        None => (None, true),
    };

    *prev = Some(ticks);

    (
        CpuRecord {
            usage_percent,
            cores: None,
            load_1m: None,
            load_5m: None,
            load_15m: None,
            warmup,
            missing: false,
        },
        warnings,
    )
}

/// Parses `cat /proc/loadavg` into the three load averages. Returns a bare
/// tuple since load figures get merged into [`CpuRecord`] by the caller.
pub fn parse_load(raw: &RawOutput) -> (Option<(f64, f64, f64)>, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let tokens: Vec<&str> = raw.stdout.split_whitespace().collect();
    if raw.exit != 0 || tokens.len() < 3 {
        warnings.push(ParseWarning::new("load", "fewer than 3 fields in /proc/loadavg"));
        return (None, warnings);
    }
    match (tokens[0].parse::<f64>(), tokens[1].parse::<f64>(), tokens[2].parse::<f64>()) {
        (Ok(a), Ok(b), Ok(c)) => (Some((a, b, c)), warnings),
        _ => {
            warnings.push(ParseWarning::new("load", "non-numeric load average field"));
            (None, warnings)
        }
    }
}

/// Parses `free -b` output into bytes (not kilobytes — the `-b` flag is
/// mandatory for the canonical-units invariant).
pub fn parse_memory(raw: &RawOutput) -> (MemoryRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();

    if raw.exit != 0 {
        warnings.push(ParseWarning::new("memory", "free exited non-zero"));
        return (MemoryRecord { missing: true, ..Default::default() }, warnings);
    }

    let mut mem_line = None;
    let mut swap_line = None;
    for line in raw.stdout.lines() {
        if line.starts_with("Mem:") {
            mem_line = Some(line);
        } else if line.starts_with("Swap:") {
            swap_line = Some(line);
        }
    }

    let Some(mem_line) = mem_line else {
        warnings.push(ParseWarning::new("memory", "no 'Mem:' line found"));
        return (MemoryRecord { missing: true, ..Default::default() }, warnings);
    };

    let fields: Vec<u64> = mem_line.split_whitespace().skip(1).filter_map(|t| t.parse().ok()).collect();
    if fields.len() < 2 {
        warnings.push(ParseWarning::new("memory", "fewer than 2 numeric fields on Mem line"));
        return (MemoryRecord { missing: true, ..Default::default() }, warnings);
    }

    let total_bytes = fields[0];
    let used_bytes = fields[1];
    let usage_percent = if total_bytes > 0 {
        Some((used_bytes as f64 / total_bytes as f64) * 100.0)
    } else {
        None
    };

    let (swap_total_bytes, swap_used_bytes) = match swap_line {
        Some(line) => {
            let swap_fields: Vec<u64> = line.split_whitespace().skip(1).filter_map(|t| t.parse().ok()).collect();
            if swap_fields.len() >= 2 {
                (Some(swap_fields[0]), Some(swap_fields[1]))
            } else {
                warnings.push(ParseWarning::new("memory.swap", "fewer than 2 numeric fields on Swap line"));
                (None, None)
            }
        }
        None => {
            warnings.push(ParseWarning::new("memory.swap", "no 'Swap:' line found"));
            (None, None)
        }
    };

    (
        MemoryRecord {
            total_bytes: Some(total_bytes),
            used_bytes: Some(used_bytes),
            usage_percent,
            swap_total_bytes,
            swap_used_bytes,
            missing: false,
        },
        warnings,
    )
}

/// Parses `df -B1 -P ...` output, one partition per data line.
pub fn parse_disk(raw: &RawOutput) -> (DiskRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();

    if raw.exit != 0 {
        warnings.push(ParseWarning::new("disk", "df exited non-zero"));
        return (DiskRecord { missing: true, ..Default::default() }, warnings);
    }

    let mut partitions = Vec::new();
    for line in raw.stdout.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let (total, used, mount_point) = (fields[1], fields[2], fields[5]);
        match (total.parse::<u64>(), used.parse::<u64>()) {
            (Ok(total_bytes), Ok(used_bytes)) => {
                let usage_percent = if total_bytes > 0 {
                    (used_bytes as f64 / total_bytes as f64) * 100.0
                } else {
                    0.0
                };
                partitions.push(DiskPartition {
                    mount_point: mount_point.to_string(),
                    total_bytes,
                    used_bytes,
                    usage_percent,
                });
            }
            _ => warnings.push(ParseWarning::new("disk", &format!("unparsable df line: {line}"))),
        }
    }

    if partitions.is_empty() {
        warnings.push(ParseWarning::new("disk", "no partitions parsed"));
        return (DiskRecord { missing: true, ..Default::default() }, warnings);
    }

    (DiskRecord { partitions, missing: false }, warnings)
}

/// Parses `cat /proc/net/dev`, differencing cumulative rx/tx byte counters
/// against the previous sample to produce bytes-per-second. Handles 64-bit
/// counter wraparound by taking the modular delta (spec §8 S5).
pub fn parse_network(
    raw: &RawOutput,
    prev: &mut HashMap<String, (u64, u64)>,
    prev_sampled_at: &mut Option<std::time::Instant>,
) -> (NetworkRecord, Vec<ParseWarning>) {
    let mut warnings = Vec::new();

    if raw.exit != 0 {
        warnings.push(ParseWarning::new("network", "no output from /proc/net/dev"));
        return (NetworkRecord { missing: true, ..Default::default() }, warnings);
    }

    let now = std::time::Instant::now();
    let elapsed_secs = prev_sampled_at.map(|t| now.duration_since(t).as_secs_f64()).unwrap_or(0.0);

    let mut current = HashMap::new();
    for line in raw.stdout.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else { continue };
        let name = name.trim().to_string();
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            warnings.push(ParseWarning::new("network", &format!("short line for interface {name}")));
            continue;
        }
        match (fields[0].parse::<u64>(), fields[8].parse::<u64>()) {
            (Ok(rx), Ok(tx)) => {
                current.insert(name, (rx, tx));
            }
            _ => warnings.push(ParseWarning::new("network", &format!("non-numeric counters for {name}"))),
        }
    }

    let warmup = prev.is_empty() || elapsed_secs <= 0.0;
    let mut interfaces = Vec::new();

    if !warmup {
        for (name, (rx, tx)) in &current {
            if let Some((prev_rx, prev_tx)) = prev.get(name) {
                let rx_delta = wrapping_delta(*prev_rx, *rx);
                let tx_delta = wrapping_delta(*prev_tx, *tx);
                interfaces.push(NetworkInterface {
                    name: name.clone(),
                    rx_bps: rx_delta as f64 / elapsed_secs,
                    tx_bps: tx_delta as f64 / elapsed_secs,
                });
            }
        }
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    }

    *prev = current;
    *prev_sampled_at = Some(now);

    (
        NetworkRecord {
            interfaces,
            warmup,
            missing: false,
        },
        warnings,
    )
}

/// u64 counter delta that treats an apparent decrease as wraparound rather
/// than a negative rate (spec §8 S5: `(100 - u64::MAX_NEAR) mod 2^64`).
fn wrapping_delta(prev: u64, current: u64) -> u64 {
    current.wrapping_sub(prev)
}

/// Parses the combined `uname -a && cat /proc/cpuinfo && cat /proc/meminfo`
/// sysinfo probe into a [`SystemInfo`] record.
pub fn parse_sysinfo(raw: &RawOutput) -> (SystemInfo, Vec<ParseWarning>) {
    let mut warnings = Vec::new();
    let mut info = SystemInfo::default();

    if raw.exit != 0 || raw.stdout.trim().is_empty() {
        warnings.push(ParseWarning::new("sysinfo", "no output from sysinfo probe"));
        return (info, warnings);
    }

    let mut lines = raw.stdout.lines();
    if let Some(uname_line) = lines.next() {
        let fields: Vec<&str> = uname_line.split_whitespace().collect();
        if fields.len() >= 3 {
            info.hostname = Some(fields[1].to_string());
            info.kernel = Some(fields[2].to_string());
            info.os_name = Some("Linux".to_string());
            info.os_version = fields.get(3).map(|s| s.to_string());
        } else {
            warnings.push(ParseWarning::new("sysinfo.uname", "fewer than 3 fields on uname line"));
        }
    }

    let mut thread_count: u32 = 0;
    for line in raw.stdout.lines() {
        if let Some(model) = line.strip_prefix("model name") {
            if info.cpu_model.is_none() {
                info.cpu_model = model.split(':').nth(1).map(|s| s.trim().to_string());
            }
            thread_count += 1;
        } else if let Some(kb) = line.strip_prefix("MemTotal:") {
            let digits: String = kb.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(kb) = digits.parse::<u64>() {
                info.total_ram_bytes = Some(kb * 1024);
            }
        }
    }

    if thread_count > 0 {
        info.cpu_threads = Some(thread_count);
        // `/proc/cpuinfo` gives one "model name" line per logical thread; without
        // per-core sibling ids there's no way to tell hyperthreads from distinct
        // cores, so this is a thread count, not a true physical core count.
        info.cpu_cores = Some(thread_count);
    } else {
        warnings.push(ParseWarning::new("sysinfo.cpuinfo", "no 'model name' lines found"));
    }

    (info, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(stdout: &str) -> RawOutput {
        RawOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit: 0,
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn first_cpu_sample_is_warmup_with_no_usage() {
        let mut prev = None;
        let (record, warnings) = parse_cpu(&raw("cpu  100 0 100 800 0 0 0 0 0 0\n"), &mut prev);
        assert!(record.warmup);
        assert_eq!(record.usage_percent, None);
        assert!(warnings.is_empty());
        assert!(prev.is_some());
    }

    #[test]
    fn second_cpu_sample_computes_busy_ratio() {
        let mut prev = None;
        let _ = parse_cpu(&raw("cpu  100 0 100 800 0 0 0 0 0 0\n"), &mut prev);
        let (record, _) = parse_cpu(&raw("cpu  150 0 150 850 0 0 0 0 0 0\n"), &mut prev);
        assert!(!record.warmup);
        // busy delta = (150-100)+(150-100) = 100, total delta = 150, idle delta = 50
        assert_eq!(record.usage_percent, Some(100.0 * (150.0 - 50.0) / 150.0));
    }

    #[test]
    fn malformed_cpu_line_is_missing_not_panicking() {
        let mut prev = None;
        let (record, warnings) = parse_cpu(&raw("not-the-stat-format\n"), &mut prev);
        assert!(record.missing);
        assert!(!warnings.is_empty());
    }

    #[test]
    fn memory_parses_bytes_from_free_dash_b() {
        let output = raw("              total        used        free\nMem:     16000000000  8000000000  8000000000\nSwap:     2000000000           0  2000000000\n");
        let (record, warnings) = parse_memory(&output);
        assert_eq!(record.total_bytes, Some(16_000_000_000));
        assert_eq!(record.used_bytes, Some(8_000_000_000));
        assert_eq!(record.usage_percent, Some(50.0));
        assert!(warnings.is_empty());
    }

    #[test]
    fn disk_parses_partitions_from_df() {
        let output = raw("Filesystem     1B-blocks       Used  Available Capacity Mounted\n/dev/sda1  1000000000 500000000  500000000      50% /\n");
        let (record, warnings) = parse_disk(&output);
        assert_eq!(record.partitions.len(), 1);
        assert_eq!(record.partitions[0].mount_point, "/");
        assert_eq!(record.partitions[0].usage_percent, 50.0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn network_first_sample_is_warmup() {
        let mut prev = HashMap::new();
        let mut prev_at = None;
        let output = raw("Inter-|   Receive\n face |bytes packets errs drop fifo frame compressed multicast|bytes\n  eth0: 1000 0 0 0 0 0 0 0 2000 0 0 0 0 0 0 0\n");
        let (record, _) = parse_network(&output, &mut prev, &mut prev_at);
        assert!(record.warmup);
        assert!(record.interfaces.is_empty());
    }

    #[test]
    fn network_counter_wraparound_is_handled_as_modular_delta() {
        let mut prev = HashMap::new();
        prev.insert("eth0".to_string(), (18_446_744_073_709_551_600u64, 0u64));
        let mut prev_at = Some(std::time::Instant::now() - Duration::from_secs(30));

        let output = raw("Inter-|   Receive\n face |bytes packets errs drop fifo frame compressed multicast|bytes\n  eth0: 100 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n");
        let (record, _) = parse_network(&output, &mut prev, &mut prev_at);

        assert_eq!(record.interfaces.len(), 1);
        let rx_bps = record.interfaces[0].rx_bps;
        // (100 - 18446744073709551600) mod 2^64 == 116, over ~30s ≈ 3.87 (spec §8 S5)
        assert!(rx_bps > 3.0 && rx_bps < 4.5, "expected ~3.87 bytes/sec, got {rx_bps}");
    }

    #[test]
    fn sysinfo_parses_uname_and_cpu_model() {
        let output = raw("Linux host1 5.15.0-generic #1 SMP x86_64\nmodel name\t: Intel(R) Xeon\nphysical id\t: 0\nMemTotal:       16000000 kB\n");
        let (info, warnings) = parse_sysinfo(&output);
        assert_eq!(info.hostname.as_deref(), Some("host1"));
        assert_eq!(info.kernel.as_deref(), Some("5.15.0-generic"));
        assert_eq!(info.cpu_model.as_deref(), Some("Intel(R) Xeon"));
        assert_eq!(info.total_ram_bytes, Some(16_000_000 * 1024));
        assert!(warnings.is_empty());
    }
}
