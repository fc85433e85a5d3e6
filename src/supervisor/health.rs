// ABOUTME: Process and host health probes used by the supervisor and the batch engine
// ABOUTME: Portable fallback plus a /proc-based implementation on Linux

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// What the supervisor needs to know about a running child and the host.
pub trait ProcessHealth: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// CPU usage of `pid` since the previous call for the same pid, in percent of one core.
    /// `None` when the platform cannot tell.
    fn cpu_percent(&self, pid: u32) -> Option<f64>;

    fn available_memory_mb(&self) -> Option<u64>;

    /// True when some live process has its working directory inside `dir`.
    fn has_process_in(&self, dir: &Path) -> bool;
}

pub fn default_health() -> Arc<dyn ProcessHealth> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsHealth::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PortableHealth)
    }
}

/// Knows only whether a pid exists.
pub struct PortableHealth;

impl ProcessHealth for PortableHealth {
    fn is_alive(&self, pid: u32) -> bool {
        pid_exists(pid)
    }

    fn cpu_percent(&self, _pid: u32) -> Option<f64> {
        None
    }

    fn available_memory_mb(&self) -> Option<u64> {
        None
    }

    fn has_process_in(&self, _dir: &Path) -> bool {
        false
    }
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence and permissions.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_exists(_pid: u32) -> bool {
    true
}

/// Reads `/proc` for CPU ticks, memory and process working directories.
pub struct ProcfsHealth {
    clock_ticks: f64,
    samples: Mutex<HashMap<u32, (u64, Instant)>>,
}

impl ProcfsHealth {
    pub fn new() -> Self {
        #[cfg(unix)]
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        #[cfg(not(unix))]
        let ticks = 100;
        Self {
            clock_ticks: if ticks > 0 { ticks as f64 } else { 100.0 },
            samples: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ProcfsHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHealth for ProcfsHealth {
    fn is_alive(&self, pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => parse_state(&stat).map(|s| s != 'Z' && s != 'X').unwrap_or(false),
            Err(_) => false,
        }
    }

    fn cpu_percent(&self, pid: u32) -> Option<f64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let ticks = parse_cpu_ticks(&stat)?;
        let now = Instant::now();
        let mut samples = self.samples.lock().ok()?;
        let previous = samples.insert(pid, (ticks, now));
        let (prev_ticks, prev_at) = previous?;
        let elapsed = now.duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let used = ticks.saturating_sub(prev_ticks) as f64 / self.clock_ticks;
        Some(used / elapsed * 100.0)
    }

    fn available_memory_mb(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available_mb(&meminfo)
    }

    fn has_process_in(&self, dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };
        let own = std::process::id().to_string();
        entries.flatten().any(|entry| {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return false;
            };
            if name == own || !name.bytes().all(|b| b.is_ascii_digit()) {
                return false;
            }
            std::fs::read_link(entry.path().join("cwd"))
                .map(|cwd| cwd.starts_with(dir))
                .unwrap_or(false)
        })
    }
}

/// Fields after the parenthesised command name; the name itself may contain spaces.
fn stat_fields(stat: &str) -> Option<Vec<&str>> {
    let close = stat.rfind(')')?;
    Some(stat[close + 1..].split_whitespace().collect())
}

fn parse_state(stat: &str) -> Option<char> {
    stat_fields(stat)?.first()?.chars().next()
}

fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let fields = stat_fields(stat)?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn parse_mem_available_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (git svn fetch) S 1 4242 4242 0 -1 4194560 1200 0 0 0 350 25 0 0 20 0 1 0 100 0 0";

    #[test]
    fn test_parse_stat_with_spaces_in_name() {
        assert_eq!(parse_state(STAT), Some('S'));
        assert_eq!(parse_cpu_ticks(STAT), Some(375));
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16314080 kB\nMemFree:          512000 kB\nMemAvailable:    1048576 kB\n";
        assert_eq!(parse_mem_available_mb(meminfo), Some(1024));
        assert_eq!(parse_mem_available_mb("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_current_process_is_alive() {
        let health = default_health();
        assert!(health.is_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_first_cpu_sample_is_unknown() {
        let health = ProcfsHealth::new();
        let pid = std::process::id();
        assert!(health.cpu_percent(pid).is_none());
        assert!(health.cpu_percent(pid).is_some());
    }
}
