//! Deduplicating alert bus.
//!
//! Publishing the same (kind, process) again while an unresolved alert is
//! inside the cooldown window refreshes that alert's timestamp instead of
//! storing a duplicate. New alerts fan out to every sink worker; history is
//! a bounded ring.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use procguard_types::{Alert, AlertKind, Severity};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{GuardError, GuardResult};
use crate::notify::SinkWorker;

/// Most recent alerts retained in memory.
const HISTORY_CAPACITY: usize = 1000;

struct DedupEntry {
    id: Uuid,
    at: Instant,
}

#[derive(Default)]
struct BusState {
    alerts: VecDeque<Alert>,
    dedup: HashMap<(AlertKind, Option<String>), DedupEntry>,
}

pub struct AlertBus {
    state: Mutex<BusState>,
    sinks: Vec<SinkWorker>,
    cooldown: Duration,
}

impl AlertBus {
    pub fn new(cooldown: Duration, sinks: Vec<SinkWorker>) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            sinks,
            cooldown,
        }
    }

    /// Publish an alert. Returns the stored alert's id, or `None` when the
    /// publish was folded into an existing unresolved alert.
    pub fn publish(
        &self,
        kind: AlertKind,
        severity: Severity,
        process: Option<&str>,
        message: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Option<Uuid> {
        let now = Instant::now();
        let key = (kind, process.map(str::to_string));
        let message = message.into();

        let alert = {
            let mut state = self.state.lock().expect("alert bus lock");

            let entry = state.dedup.get(&key).map(|e| (e.id, e.at));
            if let Some((id, at)) = entry {
                if now.duration_since(at) < self.cooldown {
                    if let Some(existing) = state
                        .alerts
                        .iter_mut()
                        .find(|a| a.id == id && a.is_active())
                    {
                        existing.created_at = chrono::Utc::now();
                        existing.message = message;
                        state.dedup.insert(key, DedupEntry { id, at: now });
                        return None;
                    }
                }
            }

            let alert = Alert {
                id: Uuid::new_v4(),
                kind,
                severity,
                process: process.map(str::to_string),
                message,
                metadata,
                created_at: chrono::Utc::now(),
                acknowledged_at: None,
                resolved_at: None,
            };
            state.dedup.insert(
                key,
                DedupEntry {
                    id: alert.id,
                    at: now,
                },
            );
            state.alerts.push_back(alert.clone());
            while state.alerts.len() > HISTORY_CAPACITY {
                state.alerts.pop_front();
            }
            alert
        };

        for sink in &self.sinks {
            sink.enqueue(alert.clone());
        }
        tracing::info!(kind = ?kind, process = process.unwrap_or("-"), "alert published");
        Some(alert.id)
    }

    /// Idempotent: acknowledging twice keeps the first timestamp.
    pub fn acknowledge(&self, id: Uuid) -> GuardResult<()> {
        let mut state = self.state.lock().expect("alert bus lock");
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(GuardError::UnknownAlert(id))?;
        if alert.acknowledged_at.is_none() {
            alert.acknowledged_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    /// Idempotent. Resolving frees the (kind, process) slot for new alerts.
    pub fn resolve(&self, id: Uuid) -> GuardResult<()> {
        let mut state = self.state.lock().expect("alert bus lock");
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(GuardError::UnknownAlert(id))?;
        if alert.resolved_at.is_none() {
            alert.resolved_at = Some(chrono::Utc::now());
        }
        state.dedup.retain(|_, entry| entry.id != id);
        Ok(())
    }

    /// Alerts in reverse chronological order.
    pub fn list(&self, active_only: bool) -> Vec<Alert> {
        let state = self.state.lock().expect("alert bus lock");
        state
            .alerts
            .iter()
            .rev()
            .filter(|a| !active_only || a.is_active())
            .cloned()
            .collect()
    }

    /// Latest active alerts for the metrics WebSocket frame.
    pub fn active_snapshot(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock().expect("alert bus lock");
        state
            .alerts
            .iter()
            .rev()
            .filter(|a| a.is_active())
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(cooldown_secs: u64) -> AlertBus {
        AlertBus::new(Duration::from_secs(cooldown_secs), Vec::new())
    }

    #[tokio::test]
    async fn duplicate_within_cooldown_refreshes_instead_of_storing() {
        let bus = bus(300);
        let first = bus
            .publish(
                AlertKind::CpuHigh,
                Severity::Warning,
                Some("web"),
                "cpu at 91%",
                BTreeMap::new(),
            )
            .unwrap();
        let stored_at = bus.list(false)[0].created_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = bus.publish(
            AlertKind::CpuHigh,
            Severity::Warning,
            Some("web"),
            "cpu at 95%",
            BTreeMap::new(),
        );

        assert!(second.is_none());
        let alerts = bus.list(false);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, first);
        assert_eq!(alerts[0].message, "cpu at 95%");
        assert!(alerts[0].created_at > stored_at);
    }

    #[tokio::test]
    async fn different_process_is_not_deduplicated() {
        let bus = bus(300);
        bus.publish(
            AlertKind::CpuHigh,
            Severity::Warning,
            Some("web"),
            "cpu",
            BTreeMap::new(),
        );
        bus.publish(
            AlertKind::CpuHigh,
            Severity::Warning,
            Some("api"),
            "cpu",
            BTreeMap::new(),
        );
        assert_eq!(bus.list(false).len(), 2);
    }

    #[tokio::test]
    async fn resolve_frees_the_dedup_slot() {
        let bus = bus(300);
        let id = bus
            .publish(
                AlertKind::MemoryHigh,
                Severity::Warning,
                Some("web"),
                "mem",
                BTreeMap::new(),
            )
            .unwrap();
        bus.resolve(id).unwrap();

        let second = bus.publish(
            AlertKind::MemoryHigh,
            Severity::Warning,
            Some("web"),
            "mem again",
            BTreeMap::new(),
        );
        assert!(second.is_some());
        assert_eq!(bus.list(false).len(), 2);
        assert_eq!(bus.list(true).len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_and_resolve_are_idempotent() {
        let bus = bus(300);
        let id = bus
            .publish(
                AlertKind::ProcessCrashed,
                Severity::Critical,
                Some("db"),
                "crashed",
                BTreeMap::new(),
            )
            .unwrap();

        bus.acknowledge(id).unwrap();
        let first_ack = bus.list(false)[0].acknowledged_at;
        bus.acknowledge(id).unwrap();
        assert_eq!(bus.list(false)[0].acknowledged_at, first_ack);

        bus.resolve(id).unwrap();
        let first_resolve = bus.list(false)[0].resolved_at;
        bus.resolve(id).unwrap();
        assert_eq!(bus.list(false)[0].resolved_at, first_resolve);
    }

    #[tokio::test]
    async fn unknown_alert_id_is_an_error() {
        let bus = bus(300);
        let err = bus.acknowledge(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn list_is_reverse_chronological() {
        let bus = bus(0);
        bus.publish(
            AlertKind::CpuHigh,
            Severity::Warning,
            Some("a"),
            "first",
            BTreeMap::new(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.publish(
            AlertKind::CpuHigh,
            Severity::Warning,
            Some("a"),
            "second",
            BTreeMap::new(),
        );
        let alerts = bus.list(false);
        assert_eq!(alerts[0].message, "second");
        assert_eq!(alerts[1].message, "first");
    }
}
