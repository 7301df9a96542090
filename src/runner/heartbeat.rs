//! Heartbeat diagnostics for the borg child process.
//!
//! Borg runs silent for long deduplication phases; without a liveness
//! signal the pod log looks hung. Every 60 s the heartbeat logs the CPU
//! time, I/O bytes, memory RSS, and network bytes consumed since the last
//! tick, all read from /proc.

use std::path::Path;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);
/// Kernel clock ticks per second on Linux.
const CLK_TCK: f64 = 100.0;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProcSample {
    pub cpu_secs: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub rss_kb: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

/// utime+stime in clock ticks from /proc/<pid>/stat. The comm field can
/// contain spaces and parentheses, so fields are counted after the last
/// ')'.
pub fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// (read_bytes, write_bytes) from /proc/<pid>/io.
pub fn parse_io(io: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for line in io.lines() {
        if let Some(value) = line.strip_prefix("read_bytes:") {
            read = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("write_bytes:") {
            write = value.trim().parse().unwrap_or(0);
        }
    }
    (read, write)
}

/// VmRSS in kB from /proc/<pid>/status.
pub fn parse_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("VmRSS:"))
        .and_then(|v| v.trim().trim_end_matches("kB").trim().parse().ok())
}

/// Total (rx, tx) bytes across interfaces from /proc/net/dev, loopback
/// excluded. Network counters are per-pod, not per-process; the deltas
/// are still the right diagnostic for a pod whose only talker is borg.
pub fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut rx = 0;
    let mut tx = 0;
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        rx += fields.first().and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        tx += fields.get(8).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
    }
    (rx, tx)
}

fn read_proc(path: &str) -> Option<String> {
    std::fs::read_to_string(Path::new(path)).ok()
}

pub fn sample(pid: u32) -> ProcSample {
    let mut s = ProcSample::default();
    if let Some(stat) = read_proc(&format!("/proc/{pid}/stat")) {
        if let Some(ticks) = parse_stat_cpu_ticks(&stat) {
            s.cpu_secs = ticks as f64 / CLK_TCK;
        }
    }
    if let Some(io) = read_proc(&format!("/proc/{pid}/io")) {
        let (read, write) = parse_io(&io);
        s.read_bytes = read;
        s.write_bytes = write;
    }
    if let Some(status) = read_proc(&format!("/proc/{pid}/status")) {
        s.rss_kb = parse_rss_kb(&status).unwrap_or(0);
    }
    if let Some(net) = read_proc("/proc/net/dev") {
        let (rx, tx) = parse_net_dev(&net);
        s.net_rx = rx;
        s.net_tx = tx;
    }
    s
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Spawn the heartbeat for a child pid. Abort the handle once the child
/// has exited.
pub fn spawn_heartbeat(pid: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and seeds the baseline.
        ticker.tick().await;
        let mut prev = sample(pid);

        loop {
            ticker.tick().await;
            if !Path::new(&format!("/proc/{pid}")).exists() {
                debug!(pid, "Heartbeat target gone");
                return;
            }
            let current = sample(pid);
            info!(
                pid,
                "borg heartbeat: cpu +{:.1}s, read +{:.1} MiB, write +{:.1} MiB, rss {:.1} MiB, net rx +{:.1} MiB / tx +{:.1} MiB",
                current.cpu_secs - prev.cpu_secs,
                mib(current.read_bytes.saturating_sub(prev.read_bytes)),
                mib(current.write_bytes.saturating_sub(prev.write_bytes)),
                current.rss_kb as f64 / 1024.0,
                mib(current.net_rx.saturating_sub(prev.net_rx)),
                mib(current.net_tx.saturating_sub(prev.net_tx)),
            );
            prev = current;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_cpu_ticks() {
        let stat = "1234 (borg create) S 1 1234 1234 0 -1 4194304 100 0 0 0 250 150 0 0 20 0 4 0 100 1000000 500 18446744073709551615";
        assert_eq!(parse_stat_cpu_ticks(stat), Some(400));
    }

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let stat = "1 (weird (name)) R 0 0 0 0 -1 0 0 0 0 0 10 20 0 0 20 0 1 0 0 0 0 0";
        assert_eq!(parse_stat_cpu_ticks(stat), Some(30));
    }

    #[test]
    fn test_parse_io() {
        let io = "rchar: 100\nwchar: 200\nread_bytes: 4096\nwrite_bytes: 8192\n";
        assert_eq!(parse_io(io), (4096, 8192));
    }

    #[test]
    fn test_parse_rss() {
        let status = "Name:\tborg\nVmPeak:\t  200000 kB\nVmRSS:\t  123456 kB\n";
        assert_eq!(parse_rss_kb(status), Some(123456));
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let net = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 1000    10    0    0    0     0          0         0     1000     10    0    0    0     0       0          0\n\
  eth0: 5000    50    0    0    0     0          0         0     7000     70    0    0    0     0       0          0\n";
        assert_eq!(parse_net_dev(net), (5000, 7000));
    }
}
