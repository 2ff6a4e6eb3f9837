//! Sliding-window crash accounting and the policy decision taken on every
//! unexpected child exit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use procguard_types::{CrashPolicy, CrashStats, CrashThresholdAction, ProcessSpec};
use tokio::time::Instant;

use crate::graph::DepGraph;

const MAX_RECORDS_PER_PROCESS: usize = 100;

#[derive(Debug, Clone)]
pub struct CrashRecord {
    pub at: Instant,
    pub wall: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub run_duration: Duration,
}

/// What the supervisor should do after an unexpected exit.
#[derive(Debug, Clone, PartialEq)]
pub enum CrashAction {
    /// No automatic restart; the process stays down.
    Hold,
    RestartAfter(Duration),
    /// Stop every process whose dependency closure contains the origin.
    CascadeShutdown(Vec<String>),
}

/// Full outcome of one `on_exit` evaluation. The supervisor applies the
/// flags and publishes alerts carrying the rationale.
#[derive(Debug, Clone)]
pub struct CrashDecision {
    pub action: CrashAction,
    /// Set the sticky disable flag.
    pub disable: bool,
    pub quarantine_until: Option<Instant>,
    pub crashes_in_window: usize,
    /// Short human rationale, also placed in alert metadata.
    pub reason: &'static str,
}

/// Flags the engine needs from the instance at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct InstanceFlags {
    pub disabled: bool,
    pub quarantine_until: Option<Instant>,
    pub consecutive_restarts: u32,
}

#[derive(Debug, Default)]
pub struct CrashEngine {
    histories: Mutex<HashMap<String, VecDeque<CrashRecord>>>,
}

fn window_of(policy: &CrashPolicy) -> Option<Duration> {
    // Zero means "every crash is inside the window".
    if policy.window_seconds > 0.0 {
        Some(Duration::from_secs_f64(policy.window_seconds))
    } else {
        None
    }
}

fn in_window(record: &CrashRecord, window: Option<Duration>, now: Instant) -> bool {
    match window {
        Some(w) => now.duration_since(record.at) <= w,
        None => true,
    }
}

impl CrashEngine {
    /// Record an unexpected exit and decide what happens next.
    pub fn on_exit(
        &self,
        spec: &ProcessSpec,
        exit_code: Option<i32>,
        run_duration: Duration,
        flags: InstanceFlags,
        graph: &DepGraph,
        now: Instant,
    ) -> CrashDecision {
        let policy = &spec.crash;
        let window = window_of(policy);

        let crashes_in_window = {
            let mut histories = self.histories.lock().expect("crash history lock");
            let records = histories.entry(spec.name.clone()).or_default();
            records.push_back(CrashRecord {
                at: now,
                wall: Utc::now(),
                exit_code,
                run_duration,
            });
            while records.len() > MAX_RECORDS_PER_PROCESS {
                records.pop_front();
            }
            if let Some(w) = window {
                while records
                    .front()
                    .is_some_and(|r| now.duration_since(r.at) > w)
                {
                    records.pop_front();
                }
            }
            records.iter().filter(|r| in_window(r, window, now)).count()
        };

        // Already held down: record the crash, take no further action.
        if flags.disabled {
            return CrashDecision {
                action: CrashAction::Hold,
                disable: false,
                quarantine_until: None,
                crashes_in_window,
                reason: "process is disabled",
            };
        }
        if flags.quarantine_until.is_some_and(|until| until > now) {
            return CrashDecision {
                action: CrashAction::Hold,
                disable: false,
                quarantine_until: None,
                crashes_in_window,
                reason: "process is quarantined",
            };
        }

        if crashes_in_window as u64 >= u64::from(policy.max_crashes) {
            return match policy.action {
                CrashThresholdAction::Disable => {
                    self.clear(&spec.name);
                    CrashDecision {
                        action: CrashAction::Hold,
                        disable: true,
                        quarantine_until: None,
                        crashes_in_window,
                        reason: "crash threshold reached: disabling",
                    }
                }
                CrashThresholdAction::Quarantine => {
                    self.clear(&spec.name);
                    CrashDecision {
                        action: CrashAction::Hold,
                        disable: false,
                        quarantine_until: Some(
                            now + Duration::from_secs_f64(policy.quarantine_seconds.max(0.0)),
                        ),
                        crashes_in_window,
                        reason: "crash threshold reached: quarantining",
                    }
                }
                CrashThresholdAction::KillDependencies => CrashDecision {
                    action: CrashAction::CascadeShutdown(graph.dependents_closure(&spec.name)),
                    disable: true,
                    quarantine_until: None,
                    crashes_in_window,
                    reason: "crash threshold reached: killing dependents",
                },
            };
        }

        // Below the crash threshold.
        if !spec.auto_restart {
            return CrashDecision {
                action: CrashAction::Hold,
                disable: false,
                quarantine_until: None,
                crashes_in_window,
                reason: "auto-restart is off",
            };
        }

        // Independent cap on consecutive automatic restarts.
        if flags.consecutive_restarts >= spec.max_restarts {
            return CrashDecision {
                action: CrashAction::Hold,
                disable: true,
                quarantine_until: None,
                crashes_in_window,
                reason: "consecutive restart limit reached: disabling",
            };
        }

        CrashDecision {
            action: CrashAction::RestartAfter(Duration::from_secs_f64(
                spec.restart_delay_seconds.max(0.0),
            )),
            disable: false,
            quarantine_until: None,
            crashes_in_window,
            reason: "restarting under policy",
        }
    }

    pub fn clear(&self, name: &str) {
        let mut histories = self.histories.lock().expect("crash history lock");
        if let Some(records) = histories.get_mut(name) {
            records.clear();
        }
    }

    pub fn remove(&self, name: &str) {
        self.histories
            .lock()
            .expect("crash history lock")
            .remove(name);
    }

    pub fn stats(&self, spec: &ProcessSpec, flags: InstanceFlags, now: Instant) -> CrashStats {
        let histories = self.histories.lock().expect("crash history lock");
        let records = histories.get(&spec.name);
        let window = window_of(&spec.crash);

        let (total, in_win, last_wall, most_common) = match records {
            Some(records) => {
                let in_win = records
                    .iter()
                    .filter(|r| in_window(r, window, now))
                    .count();
                let mut by_code: HashMap<Option<i32>, usize> = HashMap::new();
                for r in records {
                    *by_code.entry(r.exit_code).or_default() += 1;
                }
                let most_common = by_code
                    .into_iter()
                    .max_by_key(|(_, n)| *n)
                    .and_then(|(code, _)| code);
                (
                    records.len(),
                    in_win,
                    records.back().map(|r| r.wall),
                    most_common,
                )
            }
            None => (0, 0, None, None),
        };

        let quarantine_remaining = flags
            .quarantine_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_secs_f64());

        CrashStats {
            process: spec.name.clone(),
            total_crashes: total,
            crashes_in_window: in_win,
            max_crashes: spec.crash.max_crashes,
            window_seconds: spec.crash.window_seconds,
            is_disabled: flags.disabled,
            is_quarantined: quarantine_remaining.is_some(),
            quarantine_remaining_seconds: quarantine_remaining,
            last_crash_at: last_wall,
            most_common_exit_code: most_common,
        }
    }
}
