use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerDescriptor;

/// One raw resource-usage snapshot from the runtime's stats feed. The
/// runtime reports the current and previous cycle's cumulative counters in
/// the same snapshot, so deltas never need cross-message state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStats {
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: HashMap<String, NetworkStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: u64,
    #[serde(default)]
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

/// Normalized telemetry record sent to metrics clients. Percentage fields
/// are pre-rendered with two decimal digits.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub bot_id: String,
    pub timestamp: String,
    pub cpu_percent: String,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: String,
    pub network_rx: u64,
    pub network_tx: u64,
    pub status: String,
    pub running: bool,
    pub restarting: bool,
    pub paused: bool,
    pub started_at: String,
    pub finished_at: String,
    pub uptime: String,
    pub restart_count: u64,
}

pub fn iso_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn calculate_cpu_percent(raw: &RawStats) -> f64 {
    let cpu_delta = raw.cpu_stats.cpu_usage.total_usage as i64
        - raw.precpu_stats.cpu_usage.total_usage as i64;
    let system_delta =
        raw.cpu_stats.system_cpu_usage as i64 - raw.precpu_stats.system_cpu_usage as i64;

    // A negative container delta means the counter reset (restart); report
    // idle rather than a bogus value.
    if system_delta <= 0 || cpu_delta < 0 {
        return 0.0;
    }

    let cpus = if raw.cpu_stats.online_cpus > 0 {
        raw.cpu_stats.online_cpus
    } else {
        1
    };
    (cpu_delta as f64 / system_delta as f64) * cpus as f64 * 100.0
}

pub fn calculate_memory(raw: &RawStats, descriptor: &ContainerDescriptor) -> (u64, u64, f64) {
    let usage = raw.memory_stats.usage;
    // The snapshot carries no limit when the container is not running; fall
    // back to the configured limit from the descriptor.
    let limit = if raw.memory_stats.limit > 0 {
        raw.memory_stats.limit
    } else {
        descriptor.host_config.memory
    };
    let percent = if limit > 0 {
        usage as f64 / limit as f64 * 100.0
    } else {
        0.0
    };
    (usage, limit, percent)
}

pub fn calculate_network(raw: &RawStats) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for network in raw.networks.values() {
        rx += network.rx_bytes;
        tx += network.tx_bytes;
    }
    (rx, tx)
}

fn pluralize(value: i64, unit: &str) -> String {
    if value == 1 {
        format!("{} {}", value, unit)
    } else {
        format!("{} {}s", value, unit)
    }
}

/// Elapsed time since `started_at`, in the progressively coarser form the
/// panel renders for running containers.
pub fn format_uptime(started_at: &str, now: DateTime<Utc>) -> String {
    let start = match DateTime::parse_from_rfc3339(started_at) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return "Invalid date".to_string(),
    };

    let elapsed = now.signed_duration_since(start);
    if elapsed.num_seconds() <= 0 {
        return "N/A".to_string();
    }

    let seconds = elapsed.num_seconds() % 60;
    let minutes = elapsed.num_minutes() % 60;
    let hours = elapsed.num_hours() % 24;
    let days = elapsed.num_days();

    if days > 0 {
        format!("{}, {}h:{:02}m", pluralize(days, "day"), hours, minutes)
    } else if hours > 0 {
        format!("{}h:{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!(
            "{} {}",
            pluralize(minutes, "min"),
            pluralize(seconds, "sec")
        )
    } else {
        pluralize(seconds, "second")
    }
}

/// Uptime for the current descriptor: elapsed time while running, the
/// historical run duration for an exited container, otherwise "N/A".
pub fn calculate_uptime(descriptor: &ContainerDescriptor, now: DateTime<Utc>) -> String {
    let state = &descriptor.state;
    if state.running && !state.started_at.is_empty() {
        return format_uptime(&state.started_at, now);
    }

    if !state.running && state.status == "exited" {
        if let (Ok(start), Ok(end)) = (
            DateTime::parse_from_rfc3339(&state.started_at),
            DateTime::parse_from_rfc3339(&state.finished_at),
        ) {
            let duration = end.signed_duration_since(start);
            if duration.num_seconds() > 0 {
                return format!(
                    "Ran for {}h:{:02}m",
                    duration.num_hours(),
                    duration.num_minutes() % 60
                );
            }
        }
    }

    "N/A".to_string()
}

/// Pure transform from one raw snapshot plus the last observed descriptor to
/// the client-facing record. All division guards are explicit, so this never
/// fails; malformed snapshots are rejected upstream by parse failure.
pub fn derive_metrics(
    raw: &RawStats,
    descriptor: &ContainerDescriptor,
    bot_id: &str,
    restarting: bool,
    now: DateTime<Utc>,
) -> ContainerMetrics {
    let cpu_percent = calculate_cpu_percent(raw);
    let (memory_usage, memory_limit, memory_percent) = calculate_memory(raw, descriptor);
    let (network_rx, network_tx) = calculate_network(raw);
    let state = &descriptor.state;

    ContainerMetrics {
        bot_id: bot_id.to_string(),
        timestamp: iso_timestamp(now),
        cpu_percent: format!("{:.2}", cpu_percent),
        memory_usage,
        memory_limit,
        memory_percent: format!("{:.2}", memory_percent),
        network_rx,
        network_tx,
        status: status_of(descriptor),
        running: state.running,
        restarting: restarting || state.restarting,
        paused: state.paused,
        started_at: state.started_at.clone(),
        finished_at: state.finished_at.clone(),
        uptime: calculate_uptime(descriptor, now),
        restart_count: descriptor.restart_count,
    }
}

/// Zero-valued record carrying only status/uptime/restart truth, emitted by
/// the descriptor poll when the stats feed has gone silent.
pub fn synthetic_metrics(
    descriptor: &ContainerDescriptor,
    bot_id: &str,
    restarting: bool,
    now: DateTime<Utc>,
) -> ContainerMetrics {
    derive_metrics(&RawStats::default(), descriptor, bot_id, restarting, now)
}

fn status_of(descriptor: &ContainerDescriptor) -> String {
    if descriptor.state.status.is_empty() {
        "unknown".to_string()
    } else {
        descriptor.state.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, HostConfig};
    use chrono::TimeZone;

    fn raw(container_delta: i64, system_delta: i64, cpus: u32) -> RawStats {
        let base_container = 1_000_000_000i64;
        let base_system = 50_000_000_000i64;
        RawStats {
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: (base_container + container_delta) as u64,
                },
                system_cpu_usage: (base_system + system_delta) as u64,
                online_cpus: cpus,
            },
            precpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: base_container as u64,
                },
                system_cpu_usage: base_system as u64,
                online_cpus: cpus,
            },
            ..Default::default()
        }
    }

    fn running_descriptor() -> ContainerDescriptor {
        ContainerDescriptor {
            id: "c1".to_string(),
            state: ContainerState {
                status: "running".to_string(),
                running: true,
                started_at: "2024-05-01T10:00:00Z".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_cpu_percent_matches_delta_ratio() {
        let stats = raw(200_000_000, 1_000_000_000, 4);
        let percent = calculate_cpu_percent(&stats);
        assert!((percent - 80.0).abs() < 1e-9);
        assert!(percent >= 0.0 && percent <= 100.0 * 4.0);
    }

    #[test]
    fn test_cpu_percent_zero_when_host_delta_not_positive() {
        assert_eq!(calculate_cpu_percent(&raw(100, 0, 2)), 0.0);
        assert_eq!(calculate_cpu_percent(&raw(100, -5, 2)), 0.0);
    }

    #[test]
    fn test_cpu_percent_zero_on_counter_reset() {
        // Container counter went backwards after a restart.
        assert_eq!(calculate_cpu_percent(&raw(-300, 1_000_000, 2)), 0.0);
    }

    #[test]
    fn test_cpu_percent_defaults_to_one_cpu() {
        let stats = raw(500_000_000, 1_000_000_000, 0);
        assert!((calculate_cpu_percent(&stats) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_percent_zero_without_limit() {
        let mut stats = RawStats::default();
        stats.memory_stats.usage = 1024;
        let descriptor = ContainerDescriptor::default();
        let (_, limit, percent) = calculate_memory(&stats, &descriptor);
        assert_eq!(limit, 0);
        assert_eq!(percent, 0.0);
    }

    #[test]
    fn test_memory_limit_falls_back_to_descriptor() {
        let mut stats = RawStats::default();
        stats.memory_stats.usage = 64;
        let descriptor = ContainerDescriptor {
            host_config: HostConfig { memory: 256 },
            ..Default::default()
        };
        let (usage, limit, percent) = calculate_memory(&stats, &descriptor);
        assert_eq!((usage, limit), (64, 256));
        assert!((percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_network_totals_sum_all_interfaces() {
        let mut stats = RawStats::default();
        for (name, rx, tx) in [("eth0", 10, 1), ("eth1", 20, 2), ("lo", 5, 5)] {
            stats.networks.insert(
                name.to_string(),
                NetworkStats {
                    rx_bytes: rx,
                    tx_bytes: tx,
                },
            );
        }
        assert_eq!(calculate_network(&stats), (35, 8));
    }

    #[test]
    fn test_percent_fields_render_two_decimals() {
        let mut stats = raw(123_456_789, 1_000_000_000, 1);
        stats.memory_stats.usage = 1;
        stats.memory_stats.limit = 3;
        let metrics = derive_metrics(&stats, &running_descriptor(), "42", false, now());
        assert_eq!(metrics.cpu_percent, "12.35");
        assert_eq!(metrics.memory_percent, "33.33");
    }

    #[test]
    fn test_uptime_running_hours_minutes() {
        let metrics = derive_metrics(
            &RawStats::default(),
            &running_descriptor(),
            "42",
            false,
            now(),
        );
        assert_eq!(metrics.uptime, "2h:30m");
    }

    #[test]
    fn test_format_uptime_days_and_plurals() {
        let start = "2024-04-29T09:26:45Z";
        assert_eq!(format_uptime(start, now()), "2 days, 3h:04m");
        assert_eq!(format_uptime("2024-05-01T12:30:44Z", now()), "1 second");
        assert_eq!(format_uptime("2024-05-01T12:30:05Z", now()), "40 seconds");
        assert_eq!(format_uptime("2024-05-01T12:25:40Z", now()), "5 mins 5 secs");
        assert_eq!(format_uptime("2024-05-01T12:29:44Z", now()), "1 min 1 sec");
    }

    #[test]
    fn test_format_uptime_rejects_bad_input() {
        assert_eq!(format_uptime("not-a-date", now()), "Invalid date");
        // A start timestamp in the future yields no uptime.
        assert_eq!(format_uptime("2024-05-02T00:00:00Z", now()), "N/A");
    }

    #[test]
    fn test_uptime_exited_reports_run_duration() {
        let descriptor = ContainerDescriptor {
            state: ContainerState {
                status: "exited".to_string(),
                running: false,
                started_at: "2024-05-01T08:00:00Z".to_string(),
                finished_at: "2024-05-01T10:05:00Z".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(calculate_uptime(&descriptor, now()), "Ran for 2h:05m");
    }

    #[test]
    fn test_uptime_unknown_when_no_timestamps() {
        let descriptor = ContainerDescriptor {
            state: ContainerState {
                status: "created".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(calculate_uptime(&descriptor, now()), "N/A");
    }

    #[test]
    fn test_synthetic_record_is_zeroed_but_keeps_status() {
        let mut descriptor = running_descriptor();
        descriptor.state.status = "restarting".to_string();
        descriptor.restart_count = 4;
        let metrics = synthetic_metrics(&descriptor, "42", true, now());
        assert_eq!(metrics.cpu_percent, "0.00");
        assert_eq!(metrics.memory_usage, 0);
        assert_eq!(metrics.network_rx, 0);
        assert_eq!(metrics.status, "restarting");
        assert_eq!(metrics.restart_count, 4);
        assert!(metrics.restarting);
    }

    #[test]
    fn test_restarting_flag_merges_with_descriptor() {
        let mut descriptor = running_descriptor();
        descriptor.state.restarting = true;
        let metrics = derive_metrics(&RawStats::default(), &descriptor, "42", false, now());
        assert!(metrics.restarting);
    }
}
