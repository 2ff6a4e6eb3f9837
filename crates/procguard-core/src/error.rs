use std::path::PathBuf;

use uuid::Uuid;

/// Why a child could not be spawned.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("working directory missing: {}", .0.display())]
    WorkingDirMissing(PathBuf),
    #[error("{0}")]
    Other(String),
}

/// Semantic error surface of the supervisor core.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] SpawnError),

    /// Named dependencies are not running. Never retried automatically.
    #[error("dependencies not ready: {}", .0.join(", "))]
    DependencyNotReady(Vec<String>),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("unknown alert: {0}")]
    UnknownAlert(Uuid),

    #[error("process already running: {0}")]
    AlreadyRunning(String),

    #[error("process {0} is disabled; use force-enable to clear")]
    Disabled(String),

    #[error("process {name} is quarantined for {remaining_seconds:.0}s")]
    Quarantined { name: String, remaining_seconds: f64 },

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("log I/O failed: {0}")]
    LogIo(#[from] std::io::Error),
}

impl GuardError {
    /// Stable machine-readable kind for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Spawn(_) => "spawn_failed",
            Self::DependencyNotReady(_) => "dependency_not_ready",
            Self::UnknownProcess(_) | Self::UnknownAlert(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::Disabled(_) => "disabled",
            Self::Quarantined { .. } => "quarantined",
            Self::ShuttingDown => "shutting_down",
            Self::LogIo(_) => "log_io",
        }
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
