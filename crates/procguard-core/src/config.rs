//! Daemon configuration: one JSON file, the only persistent artifact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use procguard_types::ProcessSpec;

use crate::error::{GuardError, GuardResult};
use crate::graph::DepGraph;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub listen_addr: String,
    /// Seconds between sampler ticks.
    pub monitor_interval: f64,
    pub auto_start_processes: bool,
    pub log_dir: PathBuf,
    pub log_rotate_bytes: u64,
    pub log_rotate_keep: usize,
    pub graceful_shutdown_seconds: f64,
    /// Uptime after which the consecutive-restart counter resets.
    pub stable_uptime_seconds: f64,
    pub sample_ring_capacity: usize,
    pub processes: Vec<ProcessSpec>,
    pub notifications: NotificationSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_addr: "0.0.0.0:7500".to_string(),
            monitor_interval: 10.0,
            auto_start_processes: true,
            log_dir: PathBuf::from("/var/log/processguard"),
            log_rotate_bytes: 10 * 1024 * 1024,
            log_rotate_keep: 5,
            graceful_shutdown_seconds: 10.0,
            stable_uptime_seconds: 60.0,
            sample_ring_capacity: crate::sampler::DEFAULT_RING_CAPACITY,
            processes: Vec::new(),
            notifications: NotificationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub cooldown_seconds: f64,
    pub email_enabled: bool,
    pub email_smtp_server: String,
    pub email_smtp_port: u16,
    pub email_username: String,
    pub email_password: String,
    pub email_use_tls: bool,
    pub email_recipients: Vec<String>,
    pub webhook_enabled: bool,
    pub webhook_url: String,
    pub webhook_headers: BTreeMap<String, String>,
    pub slack_enabled: bool,
    pub slack_webhook_url: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300.0,
            email_enabled: false,
            email_smtp_server: String::new(),
            email_smtp_port: 587,
            email_username: String::new(),
            email_password: String::new(),
            email_use_tls: true,
            email_recipients: Vec::new(),
            webhook_enabled: false,
            webhook_url: String::new(),
            webhook_headers: BTreeMap::new(),
            slack_enabled: false,
            slack_webhook_url: String::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> GuardResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| GuardError::Config(format!("invalid JSON in {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.monitor_interval <= 0.0 {
            return Err(GuardError::Config(
                "monitor_interval must be positive".to_string(),
            ));
        }
        if self.sample_ring_capacity == 0 {
            return Err(GuardError::Config(
                "sample_ring_capacity must be at least 1".to_string(),
            ));
        }

        // Per-process validation, duplicate detection, then one bulk
        // graph build so declaration order in the file does not matter.
        let mut seen = std::collections::HashSet::new();
        for spec in &self.processes {
            validate_spec(spec)?;
            if !seen.insert(spec.name.as_str()) {
                return Err(GuardError::Config(format!(
                    "duplicate process name: {}",
                    spec.name
                )));
            }
        }
        self.dependency_graph()?;
        Ok(())
    }

    /// The validated dependency graph over `processes`, used for ordered
    /// registration and auto-start at boot.
    pub fn dependency_graph(&self) -> GuardResult<DepGraph> {
        DepGraph::build(
            self.processes
                .iter()
                .map(|spec| (spec.name.clone(), spec.depends_on.clone())),
        )
    }
}

/// Descriptor-level checks shared by config loading and live registration.
pub fn validate_spec(spec: &ProcessSpec) -> GuardResult<()> {
    if spec.name.trim().is_empty() {
        return Err(GuardError::Config("process name must be nonempty".to_string()));
    }
    if spec.command.trim().is_empty() {
        return Err(GuardError::Config(format!(
            "process {} has an empty command",
            spec.name
        )));
    }
    for (label, value) in [
        ("cpu_threshold_percent", spec.cpu_threshold_percent),
        ("memory_threshold_percent", spec.memory_threshold_percent),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(GuardError::Config(format!(
                "process {}: {label} must be within [0, 100]",
                spec.name
            )));
        }
    }
    for (label, value) in [
        ("restart_delay_seconds", spec.restart_delay_seconds),
        ("window_seconds", spec.crash.window_seconds),
        ("quarantine_seconds", spec.crash.quarantine_seconds),
    ] {
        if value < 0.0 || !value.is_finite() {
            return Err(GuardError::Config(format!(
                "process {}: {label} must be a non-negative number",
                spec.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.monitor_interval, 10.0);
        assert_eq!(cfg.log_rotate_keep, 5);
        assert_eq!(cfg.notifications.cooldown_seconds, 300.0);
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_a_full_config() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "log_level": "debug",
                "monitor_interval": 5,
                "log_dir": "/tmp/pg-logs",
                "processes": [
                    {"name": "db", "command": "postgres -D data", "working_dir": "/srv/db"},
                    {"name": "api", "command": "node api.js", "working_dir": "/srv/api",
                     "depends_on": ["db"],
                     "crash": {"max_crashes": 2, "window_seconds": 60,
                               "action": "kill_dependencies"}}
                ],
                "notifications": {
                    "slack_enabled": true,
                    "slack_webhook_url": "https://hooks.slack.com/services/T000/B000/XXX"
                }
            }"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.processes.len(), 2);
        assert!(cfg.notifications.slack_enabled);
    }

    #[test]
    fn rejects_duplicate_names() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{"processes": [
                {"name": "a", "command": "true", "working_dir": "/tmp"},
                {"name": "a", "command": "true", "working_dir": "/tmp"}
            ]}"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{"processes": [
                {"name": "api", "command": "true", "working_dir": "/tmp", "depends_on": ["db"]},
                {"name": "db", "command": "true", "working_dir": "/tmp"}
            ]}"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.dependency_graph().unwrap().topo_order()[0], "db");
    }

    #[test]
    fn rejects_dependency_cycles() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{"processes": [
                {"name": "a", "command": "true", "working_dir": "/tmp", "depends_on": ["b"]},
                {"name": "b", "command": "true", "working_dir": "/tmp", "depends_on": ["a"]}
            ]}"#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{"processes": [
                {"name": "a", "command": "true", "working_dir": "/tmp",
                 "cpu_threshold_percent": 120.0}
            ]}"#,
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cpu_threshold_percent"));
    }
}
