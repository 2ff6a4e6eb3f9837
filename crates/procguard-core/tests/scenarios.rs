//! End-to-end supervisor scenarios with real child processes.

use std::path::Path;
use std::time::{Duration, Instant};

use procguard_core::{DaemonConfig, GuardError, Supervisor};
use procguard_types::{AlertKind, ProcessSpec, ProcessState};

fn test_config(log_dir: &Path) -> DaemonConfig {
    serde_json::from_value(serde_json::json!({
        "log_dir": log_dir,
        "graceful_shutdown_seconds": 1.0,
        "monitor_interval": 1.0,
    }))
    .unwrap()
}

fn spec(value: serde_json::Value) -> ProcessSpec {
    serde_json::from_value(value).unwrap()
}

async fn wait_for_state(sup: &Supervisor, name: &str, state: ProcessState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if sup.status(name).unwrap().state == state {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {name} to reach {state:?}; currently {:?}",
                sup.status(name).unwrap().state
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn sleeper(name: &str, deps: &[&str]) -> ProcessSpec {
    spec(serde_json::json!({
        "name": name,
        "command": "sleep 30",
        "working_dir": "/tmp",
        "auto_restart": true,
        "restart_delay_seconds": 0.0,
        "max_restarts": 10,
        "depends_on": deps,
        "crash": {"max_crashes": 2, "window_seconds": 60.0, "action": "kill_dependencies"},
    }))
}

#[tokio::test]
async fn quarantine_after_rapid_crashes_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(spec(serde_json::json!({
        "name": "u",
        "command": "false",
        "working_dir": "/tmp",
        "auto_restart": true,
        "restart_delay_seconds": 0.0,
        "max_restarts": 10,
        "crash": {
            "max_crashes": 3,
            "window_seconds": 5.0,
            "action": "quarantine",
            "quarantine_seconds": 2.0
        },
    })))
    .unwrap();

    sup.start("u", false).await.unwrap();
    wait_for_state(&sup, "u", ProcessState::Quarantined).await;

    // While quarantined, start is refused with the remaining time.
    let err = sup.start("u", false).await.unwrap_err();
    assert_eq!(err.kind(), "quarantined");

    // After expiry the engine permits a start again.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    sup.start("u", false).await.unwrap();

    sup.shutdown().await;
}

#[tokio::test]
async fn clean_fast_exit_still_counts_as_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(spec(serde_json::json!({
        "name": "oneshot",
        "command": "true",
        "working_dir": "/tmp",
        "auto_restart": true,
        "restart_delay_seconds": 0.0,
        "crash": {"max_crashes": 1, "window_seconds": 60.0, "action": "disable"},
    })))
    .unwrap();

    sup.start("oneshot", false).await.unwrap();
    wait_for_state(&sup, "oneshot", ProcessState::Disabled).await;

    let stats = sup.crash_stats("oneshot").unwrap();
    assert!(stats.is_disabled);

    sup.shutdown().await;
}

#[tokio::test]
async fn cascade_disables_origin_and_stops_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(sleeper("db", &[])).unwrap();
    sup.register(sleeper("api", &["db"])).unwrap();
    sup.register(sleeper("web", &["api"])).unwrap();

    sup.start("db", false).await.unwrap();
    wait_for_state(&sup, "db", ProcessState::Running).await;
    sup.start("api", false).await.unwrap();
    wait_for_state(&sup, "api", ProcessState::Running).await;
    sup.start("web", false).await.unwrap();
    wait_for_state(&sup, "web", ProcessState::Running).await;

    // First unexpected death: restarts under policy.
    let pid = sup.status("db").unwrap().pid.unwrap();
    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    wait_for_state(&sup, "db", ProcessState::Running).await;

    // Second inside the window: threshold reached, dependents killed.
    let pid = sup.status("db").unwrap().pid.unwrap();
    unsafe { libc::kill(pid as i32, libc::SIGKILL) };

    wait_for_state(&sup, "db", ProcessState::Disabled).await;
    wait_for_state(&sup, "api", ProcessState::Stopped).await;
    wait_for_state(&sup, "web", ProcessState::Stopped).await;

    // Victims are stopped but not disabled.
    assert!(sup.status("db").unwrap().disabled);
    assert!(!sup.status("api").unwrap().disabled);
    assert!(!sup.status("web").unwrap().disabled);

    let alerts = sup.alerts().list(false);
    let killed: Vec<_> = alerts
        .iter()
        .filter(|a| a.kind == AlertKind::DependencyKilled)
        .filter_map(|a| a.process.clone())
        .collect();
    assert!(killed.contains(&"api".to_string()));
    assert!(killed.contains(&"web".to_string()));

    // Round trip: force-enable on the origin makes the whole chain
    // startable again.
    sup.force_enable("db").await.unwrap();
    wait_for_state(&sup, "db", ProcessState::Running).await;
    sup.start("api", false).await.unwrap();
    wait_for_state(&sup, "api", ProcessState::Running).await;
    sup.start("web", false).await.unwrap();
    wait_for_state(&sup, "web", ProcessState::Running).await;

    sup.shutdown().await;
}

#[tokio::test]
async fn disabled_process_requires_force_enable() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(spec(serde_json::json!({
        "name": "flaky",
        "command": "false",
        "working_dir": "/tmp",
        "auto_restart": false,
        "crash": {"max_crashes": 1, "window_seconds": 60.0, "action": "disable"},
    })))
    .unwrap();

    sup.start("flaky", false).await.unwrap();
    wait_for_state(&sup, "flaky", ProcessState::Disabled).await;

    let err = sup.start("flaky", false).await.unwrap_err();
    assert_eq!(err.kind(), "disabled");

    // force_enable clears the flag and starts the process again.
    sup.force_enable("flaky").await.unwrap();

    sup.shutdown().await;
}

#[tokio::test]
async fn start_is_gated_on_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(sleeper("db", &[])).unwrap();
    sup.register(sleeper("api", &["db"])).unwrap();

    match sup.start("api", false).await.unwrap_err() {
        GuardError::DependencyNotReady(missing) => {
            assert_eq!(missing, vec!["db".to_string()])
        }
        other => panic!("expected DependencyNotReady, got {other:?}"),
    }

    // The gate is explicit opt-out.
    sup.start("api", true).await.unwrap();
    wait_for_state(&sup, "api", ProcessState::Running).await;

    sup.shutdown().await;
}

#[tokio::test]
async fn graceful_stop_escalates_to_kill_without_crash_engine() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    // A child that ignores SIGTERM; only SIGKILL ends it.
    let script = dir.path().join("stubborn.sh");
    std::fs::write(&script, "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    sup.register(spec(serde_json::json!({
        "name": "stubborn",
        "command": script,
        "working_dir": dir.path(),
        "auto_restart": true,
    })))
    .unwrap();

    sup.start("stubborn", false).await.unwrap();
    wait_for_state(&sup, "stubborn", ProcessState::Running).await;

    let begun = Instant::now();
    sup.stop("stubborn", false).await.unwrap();
    let elapsed = begun.elapsed();

    assert_eq!(sup.status("stubborn").unwrap().state, ProcessState::Stopped);
    // TERM was ignored, so the stop took at least the grace period, then
    // KILL finished the job promptly.
    assert!(elapsed >= Duration::from_millis(900), "stopped too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "stop took too long: {elapsed:?}");

    // No crash was recorded for the explicit stop.
    assert_eq!(sup.crash_stats("stubborn").unwrap().total_crashes, 0);

    // And stopping again is an idempotent no-op.
    sup.stop("stubborn", false).await.unwrap();
    assert_eq!(sup.status("stubborn").unwrap().state, ProcessState::Stopped);

    sup.shutdown().await;
}

#[tokio::test]
async fn register_rejects_duplicates_and_busy_deregister() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Supervisor::new(&test_config(dir.path())).unwrap();

    sup.register(sleeper("db", &[])).unwrap();
    sup.register(sleeper("api", &["db"])).unwrap();

    let err = sup.register(sleeper("db", &[])).unwrap_err();
    assert_eq!(err.kind(), "config_error");

    // db cannot be removed while api requires it.
    let err = sup.deregister("db").await.unwrap_err();
    assert_eq!(err.kind(), "config_error");

    sup.deregister("api").await.unwrap();
    sup.deregister("db").await.unwrap();
    assert!(sup.list().is_empty());
}
