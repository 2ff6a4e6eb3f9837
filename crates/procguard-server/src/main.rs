use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use procguard_core::os::HostSampler;
use procguard_core::sampler::{self, SamplerHealth};
use procguard_core::{DaemonConfig, Supervisor};
use procguard_server::{router, AppState};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

fn config_path() -> PathBuf {
    if let Some(arg) = std::env::args().nth(1) {
        return PathBuf::from(arg);
    }
    if let Ok(env) = std::env::var("PROCGUARD_CONFIG") {
        return PathBuf::from(env);
    }
    PathBuf::from("/etc/processguard/config.json")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let cfg = if path.exists() {
        DaemonConfig::load(&path)
            .with_context(|| format!("load config {}", path.display()))?
    } else {
        eprintln!(
            "warning: config file {} not found, using defaults",
            path.display()
        );
        DaemonConfig::default()
    };

    // Daemon logs go to stdout and a daily file under the log dir.
    std::fs::create_dir_all(&cfg.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&cfg.log_dir, "processguard.log");
    let (file_writer, _file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let supervisor = Supervisor::new(&cfg)?;

    // Register in dependency order so every declared dependency already
    // exists when its dependents arrive.
    let graph = cfg.dependency_graph()?;
    let mut by_name: std::collections::HashMap<_, _> = cfg
        .processes
        .iter()
        .map(|spec| (spec.name.clone(), spec.clone()))
        .collect();
    for name in graph.topo_order() {
        if let Some(spec) = by_name.remove(&name) {
            supervisor.register(spec)?;
        }
    }

    let monitor_interval = Duration::from_secs_f64(cfg.monitor_interval);
    let (frames, _) = broadcast::channel(32);
    let sampler_health = Arc::new(SamplerHealth::new());
    sampler::spawn(
        supervisor.clone(),
        monitor_interval,
        frames.clone(),
        sampler_health.clone(),
    );

    if cfg.auto_start_processes {
        supervisor.start_all_topological().await;
    }

    let state = AppState {
        supervisor: supervisor.clone(),
        frames,
        sampler_health,
        monitor_interval,
        host: Arc::new(Mutex::new(HostSampler::default())),
    };

    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {}", cfg.listen_addr))?;
    tracing::info!(%addr, "processguard API listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down; stopping supervised processes");
    supervisor.shutdown().await;

    Ok(())
}
