//! REST handlers under `/api/v1`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use procguard_core::{os, GuardError};
use procguard_types::{ProcessSpec, ProcessStatus};
use uuid::Uuid;

use crate::AppState;

/// API error body: `{error: kind, detail: message}`.
pub struct ApiError(GuardError);

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "not_found" => StatusCode::NOT_FOUND,
            "config_error" => StatusCode::BAD_REQUEST,
            "dependency_not_ready" | "already_running" | "disabled" | "quarantined" => {
                StatusCode::CONFLICT
            }
            "shutting_down" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.kind(),
            "detail": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, serde::Deserialize)]
pub struct LifecycleFlags {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub ignore_dependencies: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct Acked {
    pub ok: bool,
}

pub async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessStatus>> {
    Json(state.supervisor.list())
}

pub async fn get_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProcessStatus>> {
    Ok(Json(state.supervisor.status(&name)?))
}

pub async fn create_process(
    State(state): State<AppState>,
    Json(spec): Json<ProcessSpec>,
) -> ApiResult<(StatusCode, Json<ProcessStatus>)> {
    let name = spec.name.clone();
    state.supervisor.register(spec)?;
    Ok((StatusCode::CREATED, Json(state.supervisor.status(&name)?)))
}

pub async fn delete_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Acked>> {
    state.supervisor.deregister(&name).await?;
    Ok(Json(Acked { ok: true }))
}

pub async fn start_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(flags): Query<LifecycleFlags>,
) -> ApiResult<Json<ProcessStatus>> {
    state
        .supervisor
        .start(&name, flags.ignore_dependencies)
        .await?;
    Ok(Json(state.supervisor.status(&name)?))
}

pub async fn stop_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(flags): Query<LifecycleFlags>,
) -> ApiResult<Json<ProcessStatus>> {
    state.supervisor.stop(&name, flags.force).await?;
    Ok(Json(state.supervisor.status(&name)?))
}

pub async fn restart_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(flags): Query<LifecycleFlags>,
) -> ApiResult<Json<ProcessStatus>> {
    state
        .supervisor
        .restart(&name, flags.force, flags.ignore_dependencies)
        .await?;
    Ok(Json(state.supervisor.status(&name)?))
}

pub async fn force_enable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProcessStatus>> {
    state.supervisor.force_enable(&name).await?;
    Ok(Json(state.supervisor.status(&name)?))
}

pub async fn reset_crashes(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Acked>> {
    state.supervisor.reset_crashes(&name).await?;
    Ok(Json(Acked { ok: true }))
}

pub async fn crash_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<procguard_types::CrashStats>> {
    Ok(Json(state.supervisor.crash_stats(&name)?))
}

#[derive(Debug, serde::Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    100
}

pub async fn recent_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.supervisor.tail_logs(&name, query.lines)?))
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct AlertQuery {
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Json<Vec<procguard_types::Alert>> {
    Json(state.supervisor.alerts().list(query.active_only))
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Acked>> {
    state.supervisor.alerts().acknowledge(id)?;
    Ok(Json(Acked { ok: true }))
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Acked>> {
    state.supervisor.alerts().resolve(id)?;
    Ok(Json(Acked { ok: true }))
}

pub async fn system_info() -> Json<procguard_types::HostInfo> {
    Json(os::host_info())
}

pub async fn system_metrics(State(state): State<AppState>) -> Json<procguard_types::HostMetrics> {
    let metrics = state.host.lock().expect("host sampler lock").sample();
    Json(metrics)
}

pub async fn disabled_processes(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, serde_json::Value>> {
    Json(state.supervisor.disabled_processes())
}

pub async fn quarantined_processes(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, serde_json::Value>> {
    Json(state.supervisor.quarantined_processes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_map_to_404() {
        let resp = ApiError(GuardError::UnknownProcess("x".to_string())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn guard_rejections_map_to_409() {
        for err in [
            GuardError::DependencyNotReady(vec!["db".to_string()]),
            GuardError::Disabled("x".to_string()),
            GuardError::AlreadyRunning("x".to_string()),
        ] {
            let resp = ApiError(err).into_response();
            assert_eq!(resp.status(), StatusCode::CONFLICT);
        }
    }

    #[test]
    fn config_errors_are_bad_requests() {
        let resp = ApiError(GuardError::Config("cycle".to_string())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn lifecycle_flags_default_off() {
        let flags: LifecycleFlags = serde_json::from_str("{}").unwrap();
        assert!(!flags.force);
        assert!(!flags.ignore_dependencies);
    }
}

/// 200 iff the sampler has ticked within 2x the monitor interval.
pub async fn health(State(state): State<AppState>) -> Response {
    let age = state.sampler_health.last_tick_age();
    let limit = state.monitor_interval * 2;
    if age <= limit {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "last_tick_seconds_ago": age.as_secs_f64(),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "stale",
                "last_tick_seconds_ago":
                    if age == std::time::Duration::MAX { None } else { Some(age.as_secs_f64()) },
            })),
        )
            .into_response()
    }
}
