//! REST + WebSocket control plane for the ProcessGuard daemon.

pub mod api;
pub mod ws;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use procguard_core::os::HostSampler;
use procguard_core::sampler::SamplerHealth;
use procguard_core::Supervisor;
use procguard_types::MetricsFrame;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub frames: broadcast::Sender<MetricsFrame>,
    pub sampler_health: Arc<SamplerHealth>,
    pub monitor_interval: Duration,
    /// Host CPU deltas need the previous reading, shared across requests.
    pub host: Arc<Mutex<HostSampler>>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/processes", get(api::list_processes).post(api::create_process))
        .route(
            "/processes/{name}",
            get(api::get_process).delete(api::delete_process),
        )
        .route("/processes/{name}/start", post(api::start_process))
        .route("/processes/{name}/stop", post(api::stop_process))
        .route("/processes/{name}/restart", post(api::restart_process))
        .route("/processes/{name}/force-enable", post(api::force_enable))
        .route("/processes/{name}/reset-crashes", post(api::reset_crashes))
        .route("/processes/{name}/crash-stats", get(api::crash_stats))
        .route("/processes/{name}/logs/recent", get(api::recent_logs))
        .route("/alerts", get(api::list_alerts))
        .route("/alerts/{id}/acknowledge", post(api::acknowledge_alert))
        .route("/alerts/{id}/resolve", post(api::resolve_alert))
        .route("/system/info", get(api::system_info))
        .route("/system/metrics", get(api::system_metrics))
        .route(
            "/system/disabled-processes",
            get(api::disabled_processes),
        )
        .route(
            "/system/quarantined-processes",
            get(api::quarantined_processes),
        )
        .route("/ws/metrics", get(ws::metrics_ws))
        .route("/health", get(api::health));

    Router::new()
        .nest("/api/v1", v1)
        .route("/health", get(api::health))
        .layer(cors)
        .with_state(state)
}
