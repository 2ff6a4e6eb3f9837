//! ProcessGuard supervisor core.
//!
//! The daemon's moving parts: the OS facade, per-process mailbox workers
//! with the lifecycle state machine, the sliding-window crash engine, the
//! metric sampler, per-process log files and the deduplicating alert bus
//! with its notification sinks. The REST/WS control plane lives in the
//! `procguard-server` crate on top of this one.

pub mod alerts;
pub mod config;
pub mod crash;
pub mod error;
pub mod graph;
pub mod logs;
pub mod notify;
pub mod os;
pub mod sampler;
pub mod supervisor;

pub use config::DaemonConfig;
pub use error::{GuardError, GuardResult};
pub use supervisor::Supervisor;
