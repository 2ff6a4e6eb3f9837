//! Process registry and per-process workers.
//!
//! Every registered process gets a mailbox (unbounded mpsc) whose single
//! consumer worker performs all state transitions for that process, in
//! send order. Cross-process effects — cascade shutdowns — are delivered
//! as messages to the victims' mailboxes, never as reentrant calls, so no
//! two process locks are ever held together for a mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use procguard_types::{
    AlertKind, CrashStats, MetricSample, ProcessSpec, ProcessState, ProcessStatus, Severity,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::alerts::AlertBus;
use crate::config::{self, DaemonConfig};
use crate::crash::{CrashAction, CrashEngine, InstanceFlags};
use crate::error::{GuardError, GuardResult};
use crate::graph::DepGraph;
use crate::logs::{LogManager, LogSinks};
use crate::os;
use crate::sampler::{Crossing, SampleRing, ThresholdWatch, ROLLING_WINDOW};

/// Grace period before a spawned child is considered Running even without
/// a sample.
const STARTING_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Settings {
    graceful_shutdown: Duration,
    stable_uptime: Duration,
    ring_capacity: usize,
}

struct Instance {
    spec: ProcessSpec,
    state: ProcessState,
    pid: Option<u32>,
    pgid: Option<i32>,
    started_instant: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    ever_started: bool,
    restart_count: u32,
    consecutive_restarts: u32,
    disabled: bool,
    quarantine_until: Option<Instant>,
    quarantine_wall: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    message: Option<String>,
    samples: SampleRing,
    cpu_watch: ThresholdWatch,
    mem_watch: ThresholdWatch,
    /// Bumped on every spawn and every cancellation point; timer and
    /// waiter messages carrying a stale generation are ignored.
    generation: u64,
    pending_stop: Vec<oneshot::Sender<()>>,
    /// Keeps the current run's log writer tasks alive.
    log_sinks: Option<LogSinks>,
}

impl Instance {
    fn new(spec: ProcessSpec, ring_capacity: usize) -> Self {
        Self {
            spec,
            state: ProcessState::Stopped,
            pid: None,
            pgid: None,
            started_instant: None,
            started_at: None,
            ever_started: false,
            restart_count: 0,
            consecutive_restarts: 0,
            disabled: false,
            quarantine_until: None,
            quarantine_wall: None,
            last_exit_code: None,
            message: None,
            samples: SampleRing::new(ring_capacity),
            cpu_watch: ThresholdWatch::default(),
            mem_watch: ThresholdWatch::default(),
            generation: 0,
            pending_stop: Vec::new(),
            log_sinks: None,
        }
    }

    fn flags(&self) -> InstanceFlags {
        InstanceFlags {
            disabled: self.disabled,
            quarantine_until: self.quarantine_until,
            consecutive_restarts: self.consecutive_restarts,
        }
    }

    fn quarantine_active(&self, now: Instant) -> bool {
        self.quarantine_until.is_some_and(|until| until > now)
    }
}

enum Command {
    Start {
        ignore_deps: bool,
        reply: oneshot::Sender<GuardResult<()>>,
    },
    Stop {
        /// Skip the graceful TERM phase and kill immediately.
        force: bool,
        reply: Option<oneshot::Sender<()>>,
    },
    ForceEnable {
        reply: oneshot::Sender<GuardResult<()>>,
    },
    ResetCrashes {
        reply: oneshot::Sender<()>,
    },
    ChildExited {
        generation: u64,
        exit_code: Option<i32>,
        runtime: Duration,
    },
    EscalateKill {
        generation: u64,
    },
    DeferredStart {
        generation: u64,
    },
    MarkRunning {
        generation: u64,
    },
    Sample(MetricSample),
    Disappeared,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ProcHandle {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Instance>>,
}

struct Inner {
    settings: Settings,
    procs: RwLock<HashMap<String, ProcHandle>>,
    graph: RwLock<DepGraph>,
    crash: CrashEngine,
    alerts: AlertBus,
    logs: LogManager,
}

/// A live process visible to the sampler.
pub struct LiveProc {
    pub name: String,
    pub pid: u32,
    pub uptime_seconds: f64,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(cfg: &DaemonConfig) -> GuardResult<Self> {
        let logs = LogManager::new(
            cfg.log_dir.clone(),
            cfg.log_rotate_bytes,
            cfg.log_rotate_keep,
        )?;
        let alerts = AlertBus::new(
            Duration::from_secs_f64(cfg.notifications.cooldown_seconds.max(0.0)),
            crate::notify::build_sinks(&cfg.notifications),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                settings: Settings {
                    graceful_shutdown: Duration::from_secs_f64(
                        cfg.graceful_shutdown_seconds.max(0.0),
                    ),
                    stable_uptime: Duration::from_secs_f64(cfg.stable_uptime_seconds.max(0.0)),
                    ring_capacity: cfg.sample_ring_capacity,
                },
                procs: RwLock::new(HashMap::new()),
                graph: RwLock::new(DepGraph::default()),
                crash: CrashEngine::default(),
                alerts,
                logs,
            }),
        })
    }

    pub fn alerts(&self) -> &AlertBus {
        &self.inner.alerts
    }

    /// Register a descriptor and spawn its worker. The process starts in
    /// `Stopped`.
    pub fn register(&self, spec: ProcessSpec) -> GuardResult<()> {
        config::validate_spec(&spec)?;

        let mut procs = self.inner.procs.write().expect("registry lock");
        if procs.contains_key(&spec.name) {
            return Err(GuardError::Config(format!(
                "duplicate process name: {}",
                spec.name
            )));
        }
        self.inner
            .graph
            .write()
            .expect("graph lock")
            .insert(&spec.name, &spec.depends_on)?;

        let name = spec.name.clone();
        let shared = Arc::new(Mutex::new(Instance::new(
            spec,
            self.inner.settings.ring_capacity,
        )));
        let (tx, rx) = mpsc::unbounded_channel();
        procs.insert(
            name.clone(),
            ProcHandle {
                tx: tx.clone(),
                shared: shared.clone(),
            },
        );
        drop(procs);

        tokio::spawn(run_worker(self.inner.clone(), name, shared, tx, rx));
        Ok(())
    }

    /// Stop and remove a process. Refused while another registered
    /// process depends on it.
    pub async fn deregister(&self, name: &str) -> GuardResult<()> {
        // Lock order is registry then graph, everywhere.
        let handle = {
            let mut procs = self.inner.procs.write().expect("registry lock");
            if !procs.contains_key(name) {
                return Err(GuardError::UnknownProcess(name.to_string()));
            }
            let dependents = self
                .inner
                .graph
                .read()
                .expect("graph lock")
                .dependents_closure(name);
            if !dependents.is_empty() {
                return Err(GuardError::Config(format!(
                    "process {name} is required by: {}",
                    dependents.join(", ")
                )));
            }
            self.inner.graph.write().expect("graph lock").remove(name);
            procs.remove(name).expect("checked above")
        };
        self.inner.crash.remove(name);

        let (reply, done) = oneshot::channel();
        if handle.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }

        let spec = handle.shared.lock().expect("instance lock").spec.clone();
        self.inner.logs.remove(&spec);
        Ok(())
    }

    pub async fn start(&self, name: &str, ignore_deps: bool) -> GuardResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(name, Command::Start { ignore_deps, reply })?;
        rx.await.map_err(|_| GuardError::ShuttingDown)?
    }

    pub async fn stop(&self, name: &str, force: bool) -> GuardResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(
            name,
            Command::Stop {
                force,
                reply: Some(reply),
            },
        )?;
        rx.await.map_err(|_| GuardError::ShuttingDown)?;
        Ok(())
    }

    pub async fn restart(&self, name: &str, force: bool, ignore_deps: bool) -> GuardResult<()> {
        self.stop(name, force).await?;
        self.start(name, ignore_deps).await
    }

    pub async fn force_enable(&self, name: &str) -> GuardResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(name, Command::ForceEnable { reply })?;
        rx.await.map_err(|_| GuardError::ShuttingDown)?
    }

    pub async fn reset_crashes(&self, name: &str) -> GuardResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(name, Command::ResetCrashes { reply })?;
        rx.await.map_err(|_| GuardError::ShuttingDown)?;
        Ok(())
    }

    pub fn status(&self, name: &str) -> GuardResult<ProcessStatus> {
        let procs = self.inner.procs.read().expect("registry lock");
        let handle = procs
            .get(name)
            .ok_or_else(|| GuardError::UnknownProcess(name.to_string()))?;
        Ok(self.build_status(handle))
    }

    pub fn list(&self) -> Vec<ProcessStatus> {
        let procs = self.inner.procs.read().expect("registry lock");
        let mut out: Vec<ProcessStatus> = procs.values().map(|h| self.build_status(h)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn crash_stats(&self, name: &str) -> GuardResult<CrashStats> {
        let procs = self.inner.procs.read().expect("registry lock");
        let handle = procs
            .get(name)
            .ok_or_else(|| GuardError::UnknownProcess(name.to_string()))?;
        let st = handle.shared.lock().expect("instance lock");
        Ok(self
            .inner
            .crash
            .stats(&st.spec, st.flags(), Instant::now()))
    }

    pub fn tail_logs(&self, name: &str, lines: usize) -> GuardResult<Vec<String>> {
        let spec = {
            let procs = self.inner.procs.read().expect("registry lock");
            let handle = procs
                .get(name)
                .ok_or_else(|| GuardError::UnknownProcess(name.to_string()))?;
            let spec = handle.shared.lock().expect("instance lock").spec.clone();
            spec
        };
        Ok(self.inner.logs.tail(&spec, lines)?)
    }

    /// Disabled processes with when/why, for the system surface.
    pub fn disabled_processes(&self) -> BTreeMap<String, serde_json::Value> {
        let procs = self.inner.procs.read().expect("registry lock");
        let mut out = BTreeMap::new();
        for (name, handle) in procs.iter() {
            let st = handle.shared.lock().expect("instance lock");
            if st.disabled {
                out.insert(
                    name.clone(),
                    serde_json::json!({
                        "state": st.state,
                        "last_exit_code": st.last_exit_code,
                        "reason": "excessive_crashes",
                    }),
                );
            }
        }
        out
    }

    pub fn quarantined_processes(&self) -> BTreeMap<String, serde_json::Value> {
        let now = Instant::now();
        let procs = self.inner.procs.read().expect("registry lock");
        let mut out = BTreeMap::new();
        for (name, handle) in procs.iter() {
            let st = handle.shared.lock().expect("instance lock");
            if st.quarantine_active(now) {
                let remaining = st
                    .quarantine_until
                    .map(|until| until.duration_since(now).as_secs_f64())
                    .unwrap_or(0.0);
                out.insert(
                    name.clone(),
                    serde_json::json!({
                        "quarantined_until": st.quarantine_wall,
                        "remaining_seconds": remaining,
                        "reason": "crash_quarantine",
                    }),
                );
            }
        }
        out
    }

    /// Start every registered process, dependencies first. Start errors
    /// are logged and do not abort the sweep.
    pub async fn start_all_topological(&self) {
        let order = self.inner.graph.read().expect("graph lock").topo_order();
        for name in order {
            if let Err(e) = self.start(&name, false).await {
                tracing::warn!(process = %name, error = %e, "auto-start failed");
            }
        }
    }

    /// Stop every worker, gracefully stopping running children first.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, mpsc::UnboundedSender<Command>)> = {
            let procs = self.inner.procs.read().expect("registry lock");
            procs
                .iter()
                .map(|(name, h)| (name.clone(), h.tx.clone()))
                .collect()
        };

        let mut waits = Vec::new();
        for (name, tx) in handles {
            let (reply, done) = oneshot::channel();
            if tx.send(Command::Shutdown { reply }).is_ok() {
                waits.push((name, done));
            }
        }
        for (name, done) in waits {
            if done.await.is_err() {
                tracing::warn!(process = %name, "worker exited without confirming shutdown");
            }
        }
    }

    pub(crate) fn live_snapshot(&self) -> Vec<LiveProc> {
        let procs = self.inner.procs.read().expect("registry lock");
        let mut out = Vec::new();
        for (name, handle) in procs.iter() {
            let st = handle.shared.lock().expect("instance lock");
            if st.state.has_child() {
                if let Some(pid) = st.pid {
                    out.push(LiveProc {
                        name: name.clone(),
                        pid,
                        uptime_seconds: st
                            .started_instant
                            .map(|at| at.elapsed().as_secs_f64())
                            .unwrap_or(0.0),
                    });
                }
            }
        }
        out
    }

    pub(crate) fn deliver_sample(&self, name: &str, sample: MetricSample) {
        let _ = self.send(name, Command::Sample(sample));
    }

    pub(crate) fn notify_disappeared(&self, name: &str) {
        let _ = self.send(name, Command::Disappeared);
    }

    fn send(&self, name: &str, cmd: Command) -> GuardResult<()> {
        let procs = self.inner.procs.read().expect("registry lock");
        let handle = procs
            .get(name)
            .ok_or_else(|| GuardError::UnknownProcess(name.to_string()))?;
        handle
            .tx
            .send(cmd)
            .map_err(|_| GuardError::ShuttingDown)
    }

    fn build_status(&self, handle: &ProcHandle) -> ProcessStatus {
        let st = handle.shared.lock().expect("instance lock");
        ProcessStatus {
            name: st.spec.name.clone(),
            state: st.state,
            pid: st.pid,
            started_at: st.started_at,
            restart_count: st.restart_count,
            consecutive_restarts: st.consecutive_restarts,
            disabled: st.disabled,
            quarantined_until: if st.quarantine_active(Instant::now()) {
                st.quarantine_wall
            } else {
                None
            },
            last_exit_code: st.last_exit_code,
            message: st.message.clone(),
            last_sample: st.samples.latest().cloned(),
            depends_on: st.spec.depends_on.clone(),
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    name: String,
    shared: Arc<Mutex<Instance>>,
    tx: mpsc::UnboundedSender<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Start { ignore_deps, reply } => {
                let result = handle_start(&inner, &name, &shared, &tx, ignore_deps);
                let _ = reply.send(result);
            }
            Command::Stop { force, reply } => handle_stop(&inner, &shared, &tx, force, reply),
            Command::ForceEnable { reply } => {
                let result = handle_force_enable(&inner, &name, &shared, &tx);
                let _ = reply.send(result);
            }
            Command::ResetCrashes { reply } => {
                inner.crash.clear(&name);
                shared
                    .lock()
                    .expect("instance lock")
                    .consecutive_restarts = 0;
                let _ = reply.send(());
            }
            Command::ChildExited {
                generation,
                exit_code,
                runtime,
            } => handle_exit(
                &inner,
                &name,
                &shared,
                &tx,
                Some(generation),
                exit_code,
                Some(runtime),
            ),
            Command::EscalateKill { generation } => {
                let mut st = shared.lock().expect("instance lock");
                if st.generation == generation && st.state == ProcessState::Stopping {
                    if let Some(pgid) = st.pgid {
                        os::signal(pgid, os::SignalKind::Kill);
                        st.message = Some("killed after timeout".to_string());
                    }
                }
            }
            Command::DeferredStart { generation } => {
                handle_deferred_start(&inner, &name, &shared, &tx, generation)
            }
            Command::MarkRunning { generation } => {
                let mut st = shared.lock().expect("instance lock");
                if st.generation == generation && st.state == ProcessState::Starting {
                    st.state = ProcessState::Running;
                    st.message = None;
                }
            }
            Command::Sample(sample) => handle_sample(&inner, &name, &shared, sample),
            Command::Disappeared => handle_exit(&inner, &name, &shared, &tx, None, None, None),
            Command::Shutdown { reply } => {
                shutdown_reply = Some(reply);
                handle_stop(&inner, &shared, &tx, false, None);
            }
        }

        if shutdown_reply.is_some() {
            let idle = !shared
                .lock()
                .expect("instance lock")
                .state
                .has_child();
            if idle {
                if let Some(reply) = shutdown_reply.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }
    }
}

fn handle_start(
    inner: &Arc<Inner>,
    name: &str,
    shared: &Arc<Mutex<Instance>>,
    tx: &mpsc::UnboundedSender<Command>,
    ignore_deps: bool,
) -> GuardResult<()> {
    let now = Instant::now();
    let spec = {
        let st = shared.lock().expect("instance lock");
        if st.state.has_child() {
            return Err(GuardError::AlreadyRunning(name.to_string()));
        }
        if st.disabled {
            return Err(GuardError::Disabled(name.to_string()));
        }
        if st.quarantine_active(now) {
            let remaining = st
                .quarantine_until
                .map(|until| until.duration_since(now).as_secs_f64())
                .unwrap_or(0.0);
            return Err(GuardError::Quarantined {
                name: name.to_string(),
                remaining_seconds: remaining,
            });
        }
        st.spec.clone()
    };

    if !ignore_deps {
        let not_ready = dependencies_not_running(inner, &spec);
        if !not_ready.is_empty() {
            return Err(GuardError::DependencyNotReady(not_ready));
        }
    }

    let sinks = inner.logs.sinks_for(&spec);
    match os::spawn(
        &spec.command,
        &spec.working_dir,
        &spec.env,
        sinks.stdout.clone(),
        sinks.stderr.clone(),
    ) {
        Err(e) => {
            {
                let mut st = shared.lock().expect("instance lock");
                st.generation += 1;
                st.state = ProcessState::Failed;
                st.message = Some(e.to_string());
            }
            if spec.alert_on_failure {
                let mut metadata = BTreeMap::new();
                metadata.insert("phase".to_string(), serde_json::json!("spawn"));
                metadata.insert("error".to_string(), serde_json::json!(e.to_string()));
                inner.alerts.publish(
                    AlertKind::ProcessCrashed,
                    Severity::Critical,
                    Some(name),
                    format!("failed to spawn {name}: {e}"),
                    metadata,
                );
            }
            Err(e.into())
        }
        Ok(handle) => {
            let generation = {
                let mut st = shared.lock().expect("instance lock");
                st.generation += 1;
                st.state = ProcessState::Starting;
                st.pid = Some(handle.pid);
                st.pgid = Some(handle.pgid);
                st.started_instant = Some(now);
                st.started_at = Some(Utc::now());
                st.last_exit_code = None;
                st.quarantine_until = None;
                st.quarantine_wall = None;
                st.message = Some("starting...".to_string());
                st.log_sinks = Some(sinks);
                if st.ever_started {
                    st.restart_count += 1;
                } else {
                    st.ever_started = true;
                }
                st.generation
            };
            tracing::info!(process = %name, pid = handle.pid, "process started");

            let waiter_tx = tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let exit_code = handle.wait().await;
                let _ = waiter_tx.send(Command::ChildExited {
                    generation,
                    exit_code,
                    runtime: started.elapsed(),
                });
            });

            let grace_tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STARTING_GRACE).await;
                let _ = grace_tx.send(Command::MarkRunning { generation });
            });

            Ok(())
        }
    }
}

fn dependencies_not_running(inner: &Arc<Inner>, spec: &ProcessSpec) -> Vec<String> {
    let procs = inner.procs.read().expect("registry lock");
    let mut not_ready = Vec::new();
    for dep in &spec.depends_on {
        let running = procs.get(dep).is_some_and(|h| {
            h.shared.lock().expect("instance lock").state == ProcessState::Running
        });
        if !running {
            not_ready.push(dep.clone());
        }
    }
    not_ready
}

fn handle_stop(
    inner: &Arc<Inner>,
    shared: &Arc<Mutex<Instance>>,
    tx: &mpsc::UnboundedSender<Command>,
    force: bool,
    reply: Option<oneshot::Sender<()>>,
) {
    let mut st = shared.lock().expect("instance lock");
    match st.state {
        ProcessState::Stopped
        | ProcessState::Failed
        | ProcessState::Disabled
        | ProcessState::Quarantined => {
            // Cancels any pending deferred restart.
            st.generation += 1;
            drop(st);
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        ProcessState::Stopping => {
            if let Some(reply) = reply {
                st.pending_stop.push(reply);
            }
        }
        ProcessState::Starting | ProcessState::Running => {
            st.state = ProcessState::Stopping;
            st.message = Some(if force { "killing" } else { "stopping" }.to_string());
            if let Some(reply) = reply {
                st.pending_stop.push(reply);
            }
            let pgid = st.pgid;
            let generation = st.generation;
            drop(st);

            if force {
                if let Some(pgid) = pgid {
                    os::signal(pgid, os::SignalKind::Kill);
                }
                return;
            }

            if let Some(pgid) = pgid {
                os::signal(pgid, os::SignalKind::Term);
            }
            let escalate_tx = tx.clone();
            let grace = inner.settings.graceful_shutdown;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = escalate_tx.send(Command::EscalateKill { generation });
            });
        }
    }
}

/// Child exit (or disappearance, when `generation` is `None`). The stop
/// path transitions to Stopped without consulting the crash engine;
/// everything else is an unexpected exit.
fn handle_exit(
    inner: &Arc<Inner>,
    name: &str,
    shared: &Arc<Mutex<Instance>>,
    tx: &mpsc::UnboundedSender<Command>,
    generation: Option<u64>,
    exit_code: Option<i32>,
    runtime: Option<Duration>,
) {
    let mut to_publish: Vec<(
        AlertKind,
        Severity,
        Option<String>,
        String,
        BTreeMap<String, serde_json::Value>,
    )> = Vec::new();
    let mut cascade: Vec<String> = Vec::new();
    let mut deferred: Option<(Duration, u64)> = None;

    {
        let mut st = shared.lock().expect("instance lock");
        match generation {
            Some(generation) => {
                if st.generation != generation {
                    return;
                }
            }
            None => {
                // Disappearance reported by the sampler; only meaningful
                // while we believe we own a child. Invalidate the waiter.
                if !st.state.has_child() || st.state == ProcessState::Stopping {
                    return;
                }
                st.generation += 1;
            }
        }

        let runtime = runtime.unwrap_or_else(|| {
            st.started_instant
                .map(|at| at.elapsed())
                .unwrap_or_default()
        });

        st.pid = None;
        st.pgid = None;
        st.last_exit_code = exit_code;
        // Dropping the senders lets the writer tasks flush and exit.
        drop(st.log_sinks.take());

        if st.state == ProcessState::Stopping {
            st.state = ProcessState::Stopped;
            st.message = Some("stopped".to_string());
            for reply in st.pending_stop.drain(..) {
                let _ = reply.send(());
            }
            return;
        }

        // Unexpected exit: consult the crash engine.
        let decision = {
            let graph = inner.graph.read().expect("graph lock");
            inner
                .crash
                .on_exit(&st.spec, exit_code, runtime, st.flags(), &graph, Instant::now())
        };

        if st.spec.alert_on_failure {
            let mut metadata = BTreeMap::new();
            metadata.insert("exit_code".to_string(), serde_json::json!(exit_code));
            metadata.insert(
                "run_seconds".to_string(),
                serde_json::json!(runtime.as_secs_f64()),
            );
            metadata.insert(
                "crashes_in_window".to_string(),
                serde_json::json!(decision.crashes_in_window),
            );
            metadata.insert("decision".to_string(), serde_json::json!(decision.reason));
            to_publish.push((
                AlertKind::ProcessCrashed,
                Severity::Critical,
                Some(name.to_string()),
                format!(
                    "process {name} exited unexpectedly (code {:?}) after {:.1}s",
                    exit_code,
                    runtime.as_secs_f64()
                ),
                metadata,
            ));
        }

        let mut rationale = BTreeMap::new();
        rationale.insert(
            "crashes_in_window".to_string(),
            serde_json::json!(decision.crashes_in_window),
        );
        rationale.insert(
            "max_crashes".to_string(),
            serde_json::json!(st.spec.crash.max_crashes),
        );
        rationale.insert(
            "window_seconds".to_string(),
            serde_json::json!(st.spec.crash.window_seconds),
        );
        rationale.insert("reason".to_string(), serde_json::json!(decision.reason));

        if decision.disable {
            st.disabled = true;
        }
        if let Some(until) = decision.quarantine_until {
            let remaining = until.duration_since(Instant::now());
            st.quarantine_until = Some(until);
            st.quarantine_wall = Some(
                Utc::now()
                    + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()),
            );
        }

        match decision.action {
            CrashAction::Hold => {
                if st.disabled {
                    st.state = ProcessState::Disabled;
                    st.message = Some("disabled after crashes".to_string());
                    if decision.disable {
                        to_publish.push((
                            AlertKind::ProcessDisabled,
                            Severity::Critical,
                            Some(name.to_string()),
                            format!("process {name} disabled: {}", decision.reason),
                            rationale.clone(),
                        ));
                    }
                } else if st.quarantine_active(Instant::now()) {
                    st.state = ProcessState::Quarantined;
                    let until = st.quarantine_wall;
                    st.message = Some("quarantined after crashes".to_string());
                    if decision.quarantine_until.is_some() {
                        let mut metadata = rationale.clone();
                        metadata.insert(
                            "quarantined_until".to_string(),
                            serde_json::json!(until),
                        );
                        to_publish.push((
                            AlertKind::Quarantined,
                            Severity::Warning,
                            Some(name.to_string()),
                            format!("process {name} quarantined: {}", decision.reason),
                            metadata,
                        ));
                    }
                } else {
                    st.state = ProcessState::Failed;
                    st.message = Some(match exit_code {
                        Some(code) => format!("exited with code {code}"),
                        None => "exited on signal".to_string(),
                    });
                }
            }
            CrashAction::RestartAfter(delay) => {
                st.consecutive_restarts += 1;
                st.state = ProcessState::Failed;
                st.message = Some(format!(
                    "restarting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    st.consecutive_restarts,
                    st.spec.max_restarts
                ));
                deferred = Some((delay, st.generation));
            }
            CrashAction::CascadeShutdown(victims) => {
                st.state = ProcessState::Disabled;
                st.message = Some("disabled; dependents shut down".to_string());
                to_publish.push((
                    AlertKind::ProcessDisabled,
                    Severity::Critical,
                    Some(name.to_string()),
                    format!("process {name} disabled: {}", decision.reason),
                    rationale.clone(),
                ));
                for victim in &victims {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("origin".to_string(), serde_json::json!(name));
                    to_publish.push((
                        AlertKind::DependencyKilled,
                        Severity::Warning,
                        Some(victim.clone()),
                        format!("process {victim} stopped because dependency {name} failed"),
                        metadata,
                    ));
                }
                cascade = victims;
            }
        }

        for reply in st.pending_stop.drain(..) {
            let _ = reply.send(());
        }
    }

    for (kind, severity, process, message, metadata) in to_publish {
        inner
            .alerts
            .publish(kind, severity, process.as_deref(), message, metadata);
    }

    if let Some((delay, generation)) = deferred {
        let restart_tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = restart_tx.send(Command::DeferredStart { generation });
        });
    }

    // The origin is Disabled before any victim is asked to stop.
    for victim in cascade {
        let procs = inner.procs.read().expect("registry lock");
        if let Some(handle) = procs.get(&victim) {
            let _ = handle.tx.send(Command::Stop {
                force: false,
                reply: None,
            });
        }
    }
}

fn handle_deferred_start(
    inner: &Arc<Inner>,
    name: &str,
    shared: &Arc<Mutex<Instance>>,
    tx: &mpsc::UnboundedSender<Command>,
    generation: u64,
) {
    {
        let st = shared.lock().expect("instance lock");
        if st.generation != generation
            || st.state != ProcessState::Failed
            || st.disabled
            || st.quarantine_active(Instant::now())
        {
            return;
        }
    }

    if let Err(e) = handle_start(inner, name, shared, tx, false) {
        tracing::warn!(process = %name, error = %e, "scheduled restart failed");
        let mut st = shared.lock().expect("instance lock");
        if st.state == ProcessState::Failed {
            st.message = Some(format!("auto-restart failed: {e}"));
        }
    }
}

fn handle_force_enable(
    inner: &Arc<Inner>,
    name: &str,
    shared: &Arc<Mutex<Instance>>,
    tx: &mpsc::UnboundedSender<Command>,
) -> GuardResult<()> {
    let has_child = {
        let mut st = shared.lock().expect("instance lock");
        st.disabled = false;
        st.quarantine_until = None;
        st.quarantine_wall = None;
        st.consecutive_restarts = 0;
        st.generation += 1;
        if !st.state.has_child() {
            st.state = ProcessState::Stopped;
            st.message = None;
        }
        st.state.has_child()
    };
    inner.crash.clear(name);
    tracing::info!(process = %name, "force-enabled");

    if has_child {
        return Ok(());
    }
    handle_start(inner, name, shared, tx, false)
}

fn handle_sample(
    inner: &Arc<Inner>,
    name: &str,
    shared: &Arc<Mutex<Instance>>,
    sample: MetricSample,
) {
    let mut to_publish: Vec<(
        AlertKind,
        Severity,
        String,
        BTreeMap<String, serde_json::Value>,
    )> = Vec::new();

    {
        let mut st = shared.lock().expect("instance lock");
        if !st.state.has_child() {
            return;
        }
        if st.state == ProcessState::Starting {
            st.state = ProcessState::Running;
            st.message = None;
        }

        if sample.uptime_seconds >= inner.settings.stable_uptime.as_secs_f64() {
            st.consecutive_restarts = 0;
        }

        st.samples.push(sample);

        let cpu_mean = st.samples.mean_last(ROLLING_WINDOW, |s| s.cpu_percent);
        let mem_mean = st.samples.mean_last(ROLLING_WINDOW, |s| s.memory_percent);

        if st.spec.alert_on_high_cpu {
            let cpu_threshold_percent = st.spec.cpu_threshold_percent;
            match st.cpu_watch.observe(cpu_mean, cpu_threshold_percent) {
                Some(Crossing::Raised) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("cpu_percent".to_string(), serde_json::json!(cpu_mean));
                    metadata.insert(
                        "threshold".to_string(),
                        serde_json::json!(st.spec.cpu_threshold_percent),
                    );
                    to_publish.push((
                        AlertKind::CpuHigh,
                        Severity::Warning,
                        format!(
                            "process {name} CPU at {cpu_mean:.1}% (threshold {:.0}%)",
                            st.spec.cpu_threshold_percent
                        ),
                        metadata,
                    ));
                }
                Some(Crossing::Cleared) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("metric".to_string(), serde_json::json!("cpu"));
                    metadata.insert("cpu_percent".to_string(), serde_json::json!(cpu_mean));
                    to_publish.push((
                        AlertKind::ThresholdCleared,
                        Severity::Info,
                        format!("process {name} CPU back to {cpu_mean:.1}%"),
                        metadata,
                    ));
                }
                None => {}
            }
        }

        if st.spec.alert_on_high_memory {
            let memory_threshold_percent = st.spec.memory_threshold_percent;
            match st.mem_watch.observe(mem_mean, memory_threshold_percent) {
                Some(Crossing::Raised) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("memory_percent".to_string(), serde_json::json!(mem_mean));
                    metadata.insert(
                        "threshold".to_string(),
                        serde_json::json!(st.spec.memory_threshold_percent),
                    );
                    to_publish.push((
                        AlertKind::MemoryHigh,
                        Severity::Warning,
                        format!(
                            "process {name} memory at {mem_mean:.1}% (threshold {:.0}%)",
                            st.spec.memory_threshold_percent
                        ),
                        metadata,
                    ));
                }
                Some(Crossing::Cleared) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("metric".to_string(), serde_json::json!("memory"));
                    metadata.insert("memory_percent".to_string(), serde_json::json!(mem_mean));
                    to_publish.push((
                        AlertKind::ThresholdCleared,
                        Severity::Info,
                        format!("process {name} memory back to {mem_mean:.1}%"),
                        metadata,
                    ));
                }
                None => {}
            }
        }
    }

    for (kind, severity, message, metadata) in to_publish {
        inner
            .alerts
            .publish(kind, severity, Some(name), message, metadata);
    }
}
