//! OS facade: child spawning, process-group signalling and `/proc` reads.
//!
//! Everything the rest of the core knows about the operating system goes
//! through this module. Children are started in their own session so the
//! whole process tree (shell wrappers included) can be signalled by pgid.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::SpawnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Term,
    Kill,
    Interrupt,
}

/// A spawned child. `wait` must be called exactly once; the supervisor's
/// waiter task owns that call.
#[derive(Debug)]
pub struct ChildHandle {
    pub pid: u32,
    pub pgid: i32,
    child: tokio::process::Child,
}

impl ChildHandle {
    /// Await termination; returns the exit code when the child exited
    /// normally, `None` when it was killed by a signal.
    pub async fn wait(mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }
}

/// Spawn `command` (whitespace-split) in `cwd` with `env` overrides.
///
/// stdout/stderr are piped; pump tasks forward each line into the provided
/// sinks until the streams close. The child gets its own session so that
/// [`signal`] with its pgid reaches grandchildren.
pub fn spawn(
    command: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    stdout_sink: mpsc::UnboundedSender<String>,
    stderr_sink: mpsc::UnboundedSender<String>,
) -> Result<ChildHandle, SpawnError> {
    let mut parts = command.split_whitespace();
    let exec = parts
        .next()
        .ok_or_else(|| SpawnError::Other("empty command".to_string()))?;

    if !cwd.is_dir() {
        return Err(SpawnError::WorkingDirMissing(cwd.to_path_buf()));
    }

    let mut cmd = Command::new(exec);
    cmd.args(parts)
        .current_dir(cwd)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session: the child leads its own process group, so
                // signalling -pgid reaches shell wrappers too.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // A dead supervisor must not leave orphans behind.
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SpawnError::NotFound(exec.to_string()),
        std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(exec.to_string()),
        _ => SpawnError::Other(format!("spawn {exec}: {e}")),
    })?;

    let pid = child
        .id()
        .ok_or_else(|| SpawnError::Other(format!("spawn {exec}: child exited immediately")))?;

    if let Some(out) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stdout_sink.send(line);
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_sink.send(line);
            }
        });
    }

    Ok(ChildHandle {
        pid,
        pgid: pid as i32,
        child,
    })
}

/// Best-effort signal to a process group. An already-exited group is not
/// an error.
pub fn signal(pgid: i32, kind: SignalKind) {
    #[cfg(unix)]
    {
        let sig = match kind {
            SignalKind::Term => libc::SIGTERM,
            SignalKind::Kill => libc::SIGKILL,
            SignalKind::Interrupt => libc::SIGINT,
        };
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, kind);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The PID no longer exists.
    #[error("process not found")]
    NotFound,
    #[error("proc read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw `/proc` reading for one PID. CPU percent is derived by the sampler
/// from the tick delta between two readings.
#[derive(Debug, Clone, Copy)]
pub struct ProcSample {
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
    pub threads: u32,
    pub open_files: u32,
    pub connections: u32,
}

/// Kernel clock ticks per second (USER_HZ), cached after the first
/// sysconf call. The 100 Hz fallback matches what virtually every Linux
/// build ships with.
#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> f64 {
    static HZ: OnceLock<f64> = OnceLock::new();
    *HZ.get_or_init(|| {
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz > 0 { hz as f64 } else { 100.0 }
    })
}

#[cfg(not(target_os = "linux"))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

/// Bytes per page, for converting `statm` resident pages to RSS bytes.
#[cfg(target_os = "linux")]
fn rss_page_bytes() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    })
}

#[cfg(not(target_os = "linux"))]
fn rss_page_bytes() -> u64 {
    4096
}

/// Parse utime+stime and thread count out of a `/proc/<pid>/stat` line.
fn parse_stat_line(s: &str) -> Option<(u64, u32)> {
    // The comm field may contain spaces; fields are counted after the
    // closing paren.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    let threads: u32 = parts.get(17)?.parse().ok()?;
    Some((utime.saturating_add(stime), threads))
}

#[cfg(target_os = "linux")]
pub async fn sample(pid: u32) -> Result<ProcSample, SampleError> {
    let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));
    if !proc_dir.exists() {
        return Err(SampleError::NotFound);
    }

    let stat = match tokio::fs::read_to_string(proc_dir.join("stat")).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SampleError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let (cpu_ticks, threads) =
        parse_stat_line(&stat).ok_or_else(|| SampleError::Io(std::io::Error::other("bad stat")))?;

    let statm = tokio::fs::read_to_string(proc_dir.join("statm"))
        .await
        .unwrap_or_default();
    let rss_bytes = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .map(|pages| pages.saturating_mul(rss_page_bytes()))
        .unwrap_or(0);

    let mut open_files = 0u32;
    let mut connections = 0u32;
    if let Ok(mut rd) = tokio::fs::read_dir(proc_dir.join("fd")).await {
        while let Ok(Some(de)) = rd.next_entry().await {
            open_files = open_files.saturating_add(1);
            if let Ok(target) = tokio::fs::read_link(de.path()).await {
                if target.to_string_lossy().starts_with("socket:") {
                    connections = connections.saturating_add(1);
                }
            }
        }
    }

    Ok(ProcSample {
        cpu_ticks,
        rss_bytes,
        threads,
        open_files,
        connections,
    })
}

#[cfg(not(target_os = "linux"))]
pub async fn sample(_pid: u32) -> Result<ProcSample, SampleError> {
    Ok(ProcSample {
        cpu_ticks: 0,
        rss_bytes: 0,
        threads: 0,
        open_files: 0,
        connections: 0,
    })
}

/// CPU percent from two tick readings, as in `/proc` clock ticks.
pub fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta / clock_ticks_per_second()) / dt * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

/// Total memory in bytes, from `/proc/meminfo`.
pub fn total_memory_bytes() -> u64 {
    static TOTAL: OnceLock<u64> = OnceLock::new();
    *TOTAL.get_or_init(|| meminfo_kib("MemTotal:").saturating_mul(1024))
}

fn meminfo_kib(key: &str) -> u64 {
    let Ok(s) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    0
}

/// Host-wide CPU/memory/load reader. Keeps the previous `/proc/stat`
/// totals so cpu_percent is a true delta.
#[derive(Debug, Default)]
pub struct HostSampler {
    prev: Option<(u64, u64)>,
}

impl HostSampler {
    pub fn sample(&mut self) -> procguard_types::HostMetrics {
        let (total, idle) = read_cpu_totals();
        let cpu_percent = match self.prev {
            Some((pt, pi)) => {
                let dt = total.saturating_sub(pt) as f64;
                let di = idle.saturating_sub(pi) as f64;
                if dt > 0.0 {
                    ((dt - di) / dt * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev = Some((total, idle));

        let memory_total_bytes = total_memory_bytes();
        let memory_available_bytes = meminfo_kib("MemAvailable:").saturating_mul(1024);
        let memory_percent = if memory_total_bytes > 0 {
            (memory_total_bytes.saturating_sub(memory_available_bytes)) as f64
                / memory_total_bytes as f64
                * 100.0
        } else {
            0.0
        };

        procguard_types::HostMetrics {
            timestamp: chrono::Utc::now(),
            cpu_percent,
            memory_percent,
            memory_total_bytes,
            memory_available_bytes,
            load_average: read_load_average(),
            uptime_seconds: read_uptime_seconds(),
        }
    }
}

fn read_cpu_totals() -> (u64, u64) {
    let Ok(s) = std::fs::read_to_string("/proc/stat") else {
        return (0, 0);
    };
    let Some(line) = s.lines().next() else {
        return (0, 0);
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
    (total, idle)
}

fn read_load_average() -> [f64; 3] {
    let Ok(s) = std::fs::read_to_string("/proc/loadavg") else {
        return [0.0; 3];
    };
    let mut it = s.split_whitespace().filter_map(|v| v.parse::<f64>().ok());
    [
        it.next().unwrap_or(0.0),
        it.next().unwrap_or(0.0),
        it.next().unwrap_or(0.0),
    ]
}

fn read_uptime_seconds() -> f64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse().ok())
        .unwrap_or(0.0)
}

/// Static host facts for `GET /system/info`.
pub fn host_info() -> procguard_types::HostInfo {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    procguard_types::HostInfo {
        hostname,
        platform: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        total_memory_bytes: total_memory_bytes(),
        listening_ports: list_listening_ports(),
    }
}

/// Listening TCP sockets with the owning PID where it can be resolved
/// from `/proc/<pid>/fd`. Used by collaborators, not by the core
/// algorithms.
pub fn list_listening_ports() -> Vec<procguard_types::ListeningPort> {
    let mut by_inode: Vec<(u64, u16)> = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(s) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in s.lines().skip(1) {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // st column 0A = LISTEN
            if cols.get(3) != Some(&"0A") {
                continue;
            }
            let Some(port) = cols
                .get(1)
                .and_then(|addr| addr.rsplit(':').next())
                .and_then(|hex| u16::from_str_radix(hex, 16).ok())
            else {
                continue;
            };
            let Some(inode) = cols.get(9).and_then(|v| v.parse::<u64>().ok()) else {
                continue;
            };
            by_inode.push((inode, port));
        }
    }

    let pid_of_inode = socket_inode_owners(&by_inode);
    let mut out: Vec<procguard_types::ListeningPort> = by_inode
        .into_iter()
        .map(|(inode, port)| procguard_types::ListeningPort {
            port,
            pid: pid_of_inode.get(&inode).copied(),
        })
        .collect();
    out.sort_by_key(|p| p.port);
    out.dedup_by_key(|p| p.port);
    out
}

fn socket_inode_owners(wanted: &[(u64, u16)]) -> std::collections::HashMap<u64, u32> {
    let mut owners = std::collections::HashMap::new();
    if wanted.is_empty() {
        return owners;
    }
    let wanted_inodes: std::collections::HashSet<u64> =
        wanted.iter().map(|(inode, _)| *inode).collect();

    let Ok(rd) = std::fs::read_dir("/proc") else {
        return owners;
    };
    for de in rd.flatten() {
        let Ok(pid) = de.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(de.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if wanted_inodes.contains(&inode) {
                owners.entry(inode).or_insert(pid);
            }
        }
    }
    owners
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_line_handles_spaced_comm() {
        // comm with a space and parens, 52-field stat line shape
        let line = "1234 (my prog) S 1 1234 1234 0 -1 4194304 100 0 0 0 \
                    250 50 0 0 20 0 7 0 12345 1000000 500 18446744073709551615 \
                    0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let (ticks, threads) = parse_stat_line(line).unwrap();
        assert_eq!(ticks, 300);
        assert_eq!(threads, 7);
    }

    #[test]
    fn cpu_percent_is_zero_without_elapsed_time() {
        let now = Instant::now();
        assert_eq!(cpu_percent(100, now, 200, now), 0.0);
    }

    #[tokio::test]
    async fn sample_unknown_pid_is_not_found() {
        // PID 0 never has a /proc entry we can read as a process.
        let err = sample(u32::MAX - 1).await.unwrap_err();
        assert!(matches!(err, SampleError::NotFound));
    }

    #[tokio::test]
    async fn spawn_missing_command_maps_to_not_found() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::unbounded_channel();
        let (err_tx, _err_rx) = tokio::sync::mpsc::unbounded_channel();
        let err = spawn(
            "definitely-not-a-command-xyz",
            std::path::Path::new("/tmp"),
            &std::collections::BTreeMap::new(),
            out_tx,
            err_tx,
        )
        .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound(_)));
    }

    #[tokio::test]
    async fn spawn_missing_cwd_is_reported() {
        let (out_tx, _out_rx) = tokio::sync::mpsc::unbounded_channel();
        let (err_tx, _err_rx) = tokio::sync::mpsc::unbounded_channel();
        let err = spawn(
            "true",
            std::path::Path::new("/definitely/not/a/dir"),
            &std::collections::BTreeMap::new(),
            out_tx,
            err_tx,
        )
        .unwrap_err();
        assert!(matches!(err, SpawnError::WorkingDirMissing(_)));
    }
}
