//! Host introspection for session `info` records.
//!
//! | Field      | Source                          |
//! |------------|---------------------------------|
//! | `hostname` | `gethostname(2)`                |
//! | `ip`       | default-route source address    |
//! | `cpus`     | `available_parallelism()`       |
//! | `memory`   | `/proc/meminfo`                 |
//! | `uptime`   | `/proc/uptime`                  |

use serde::Serialize;

use crate::util;

/// Snapshot of the machine hosting a feature instance.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub ip: String,
    pub platform: &'static str,
    pub arch: &'static str,
    pub cpus: usize,
    pub memory: MemoryInfo,
    /// System uptime in seconds.
    pub uptime: u64,
    pub username: String,
}

/// Memory totals in bytes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let meminfo = read_proc_file("/proc/meminfo");
        let (total_kb, available_kb) = parse_meminfo(&meminfo);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let uptime = read_proc_file("/proc/uptime")
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0) as u64;

        Self {
            hostname: util::hostname(),
            ip: util::primary_ip(),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            memory: MemoryInfo {
                total: total_kb * 1024,
                free: available_kb * 1024,
            },
            uptime,
            username: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

fn read_proc_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Parse `MemTotal` and `MemAvailable` (in kB) from `/proc/meminfo` content.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        }
    }
    (total, available)
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
