//! Shared data model for the ProcessGuard supervisor.
//!
//! These types cross the boundary between the core daemon, the REST/WS
//! control plane, and the configuration file. They carry no I/O.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Disabled,
    Quarantined,
}

impl ProcessState {
    /// True while a live child PID is owned by the daemon.
    pub fn has_child(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Informational tag describing what kind of program a descriptor launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Nodejs,
    Python,
    Java,
    Go,
    Rust,
    #[default]
    Generic,
}

/// Action taken when a process exceeds its crash threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashThresholdAction {
    #[default]
    Disable,
    Quarantine,
    KillDependencies,
}

/// Per-process crash policy: how many crashes inside a sliding window are
/// tolerated, and what happens when the count is reached.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CrashPolicy {
    /// Crashes inside the window before the action fires. Zero means the
    /// first crash already triggers it.
    pub max_crashes: u32,
    /// Sliding window length in seconds. Zero means every recorded crash
    /// counts regardless of age.
    pub window_seconds: f64,
    pub action: CrashThresholdAction,
    /// Only meaningful for [`CrashThresholdAction::Quarantine`].
    pub quarantine_seconds: f64,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            max_crashes: 5,
            window_seconds: 600.0,
            action: CrashThresholdAction::Disable,
            quarantine_seconds: 3600.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay() -> f64 {
    5.0
}

fn default_threshold() -> f64 {
    80.0
}

/// Declared configuration for one supervised process.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    /// Unique, stable identity. Nonempty.
    pub name: String,
    /// Command line, split on whitespace at spawn time.
    pub command: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub kind: ProcessKind,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Cap on consecutive automatic restarts, independent of the crash
    /// policy. Resets once the process stays up long enough.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_seconds: f64,
    #[serde(default = "default_threshold")]
    pub cpu_threshold_percent: f64,
    #[serde(default = "default_threshold")]
    pub memory_threshold_percent: f64,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default = "default_true")]
    pub alert_on_high_cpu: bool,
    #[serde(default = "default_true")]
    pub alert_on_high_memory: bool,
    #[serde(default)]
    pub crash: CrashPolicy,
    /// Names of processes this one requires to be running.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Explicit log file path; derived from the log dir when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// One point-in-time resource reading for a running process.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub memory_percent: f64,
    pub threads: u32,
    pub open_files: u32,
    pub connections: u32,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CpuHigh,
    MemoryHigh,
    ProcessCrashed,
    ProcessDisabled,
    Quarantined,
    DependencyKilled,
    ThresholdCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A stored alert with acknowledge/resolve lifecycle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    pub process: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Point-in-time view of a supervised process, as served by the API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_restarts: u32,
    pub disabled: bool,
    pub quarantined_until: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub message: Option<String>,
    pub last_sample: Option<MetricSample>,
    pub depends_on: Vec<String>,
}

/// Crash bookkeeping summary for one process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrashStats {
    pub process: String,
    pub total_crashes: usize,
    pub crashes_in_window: usize,
    pub max_crashes: u32,
    pub window_seconds: f64,
    pub is_disabled: bool,
    pub is_quarantined: bool,
    pub quarantine_remaining_seconds: Option<f64>,
    pub last_crash_at: Option<DateTime<Utc>>,
    pub most_common_exit_code: Option<i32>,
}

/// A TCP port something on the host is listening on.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ListeningPort {
    pub port: u16,
    pub pid: Option<u32>,
}

/// Static facts about the host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub platform: String,
    pub architecture: String,
    pub cpu_count: u32,
    pub total_memory_bytes: u64,
    pub listening_ports: Vec<ListeningPort>,
}

/// Host-wide resource reading.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HostMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub load_average: [f64; 3],
    pub uptime_seconds: f64,
}

/// One WebSocket frame, pushed per sampler tick.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsFrame {
    pub timestamp: DateTime<Utc>,
    pub system: HostMetrics,
    pub processes: BTreeMap<String, MetricSample>,
    pub alerts: Vec<Alert>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_child_ownership() {
        assert!(ProcessState::Starting.has_child());
        assert!(ProcessState::Running.has_child());
        assert!(ProcessState::Stopping.has_child());
        assert!(!ProcessState::Stopped.has_child());
        assert!(!ProcessState::Disabled.has_child());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ProcessSpec = serde_json::from_str(
            r#"{"name":"web","command":"node server.js","working_dir":"/srv/web"}"#,
        )
        .unwrap();
        assert!(spec.auto_restart);
        assert_eq!(spec.max_restarts, 5);
        assert_eq!(spec.crash.max_crashes, 5);
        assert_eq!(spec.crash.action, CrashThresholdAction::Disable);
        assert!(spec.depends_on.is_empty());
    }

    #[test]
    fn crash_action_uses_snake_case() {
        let action: CrashThresholdAction =
            serde_json::from_str(r#""kill_dependencies""#).unwrap();
        assert_eq!(action, CrashThresholdAction::KillDependencies);
    }
}
