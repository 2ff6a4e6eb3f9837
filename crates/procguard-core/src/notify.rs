//! Notification sinks and their delivery workers.
//!
//! A sink is a capability: deliver one alert, report the outcome once, no
//! retries. Each sink gets its own worker task draining a bounded queue so
//! slow SMTP/HTTP never blocks the alert bus or a process worker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use procguard_types::{Alert, Severity};
use tokio::sync::Notify;

use crate::config::NotificationSettings;

/// Delivery capability. Implementations must not retry on their own.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Queue capacity per sink. Overflow drops the oldest non-critical alert;
/// critical alerts are never dropped.
pub const SINK_QUEUE_CAPACITY: usize = 256;

struct SinkQueue {
    buf: Mutex<VecDeque<Alert>>,
    notify: Notify,
    capacity: usize,
}

/// Handle to one running sink worker.
#[derive(Clone)]
pub struct SinkWorker {
    name: &'static str,
    queue: Arc<SinkQueue>,
}

impl SinkWorker {
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        let queue = Arc::new(SinkQueue {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        });

        let worker_queue = queue.clone();
        let name = sink.name();
        tokio::spawn(async move {
            loop {
                let next = worker_queue.buf.lock().expect("sink queue lock").pop_front();
                match next {
                    Some(alert) => {
                        if let Err(e) = sink.deliver(&alert).await {
                            tracing::warn!(sink = name, alert = %alert.id, error = %e,
                                "notification delivery failed");
                        }
                    }
                    None => worker_queue.notify.notified().await,
                }
            }
        });

        Self { name, queue }
    }

    pub fn enqueue(&self, alert: Alert) {
        {
            let mut buf = self.queue.buf.lock().expect("sink queue lock");
            if buf.len() >= self.queue.capacity {
                let evictable = buf.iter().position(|a| a.severity != Severity::Critical);
                match evictable {
                    Some(idx) => {
                        buf.remove(idx);
                        tracing::warn!(sink = self.name, "sink queue full; dropped oldest alert");
                    }
                    None if alert.severity != Severity::Critical => {
                        tracing::warn!(sink = self.name, "sink queue full; dropped incoming alert");
                        return;
                    }
                    // Queue full of critical alerts: keep the critical
                    // newcomer anyway rather than lose it.
                    None => {}
                }
            }
            buf.push_back(alert);
        }
        self.queue.notify.notify_one();
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<Alert> {
        self.queue.buf.lock().unwrap().iter().cloned().collect()
    }
}

fn alert_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "alert_id": alert.id,
        "kind": alert.kind,
        "severity": alert.severity,
        "process": alert.process,
        "message": alert.message,
        "timestamp": alert.created_at.to_rfc3339(),
        "metadata": alert.metadata,
    })
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "INFO",
        Severity::Warning => "WARNING",
        Severity::Critical => "CRITICAL",
    }
}

pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailSink {
    pub fn from_settings(cfg: &NotificationSettings) -> anyhow::Result<Self> {
        let builder = if cfg.email_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.email_smtp_server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.email_smtp_server)
        };
        let transport = builder
            .port(cfg.email_smtp_port)
            .credentials(Credentials::new(
                cfg.email_username.clone(),
                cfg.email_password.clone(),
            ))
            .build();

        let from: Mailbox = cfg
            .email_username
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid email_username: {e}"))?;
        let recipients = cfg
            .email_recipients
            .iter()
            .map(|r| {
                r.parse()
                    .map_err(|e| anyhow::anyhow!("invalid email recipient {r}: {e}"))
            })
            .collect::<anyhow::Result<Vec<Mailbox>>>()?;
        if recipients.is_empty() {
            anyhow::bail!("email_enabled but email_recipients is empty");
        }

        Ok(Self {
            transport,
            from,
            recipients,
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let subject = format!(
            "[ProcessGuard] {}: {}",
            severity_label(alert.severity),
            alert.message
        );
        let body = format!(
            "Alert details:\n- Kind: {:?}\n- Severity: {}\n- Time: {}\n- Process: {}\n\n{}\n\nMetadata:\n{}\n",
            alert.kind,
            severity_label(alert.severity),
            alert.created_at.to_rfc3339(),
            alert.process.as_deref().unwrap_or("system"),
            alert.message,
            serde_json::to_string_pretty(&alert.metadata).unwrap_or_default(),
        );

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject);
        for to in &self.recipients {
            builder = builder.to(to.clone());
        }
        let message = builder.body(body)?;

        self.transport.send(message).await?;
        Ok(())
    }
}

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    headers: reqwest::header::HeaderMap,
}

impl WebhookSink {
    pub fn from_settings(cfg: &NotificationSettings) -> anyhow::Result<Self> {
        if cfg.webhook_url.is_empty() {
            anyhow::bail!("webhook_enabled but webhook_url is empty");
        }
        let mut headers = reqwest::header::HeaderMap::new();
        for (k, v) in &cfg.webhook_headers {
            let name: reqwest::header::HeaderName = k
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid webhook header name {k}: {e}"))?;
            let value: reqwest::header::HeaderValue = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid webhook header value for {k}: {e}"))?;
            headers.insert(name, value);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: cfg.webhook_url.clone(),
            headers,
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&alert_payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Slack incoming-webhook sink: a webhook specialization with the
/// attachment payload Slack renders.
pub struct SlackSink {
    client: reqwest::Client,
    url: String,
}

impl SlackSink {
    pub fn from_settings(cfg: &NotificationSettings) -> anyhow::Result<Self> {
        if cfg.slack_webhook_url.is_empty() {
            anyhow::bail!("slack_enabled but slack_webhook_url is empty");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: cfg.slack_webhook_url.clone(),
        })
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        let color = match alert.severity {
            Severity::Info => "#36a64f",
            Severity::Warning => "#ff9500",
            Severity::Critical => "#ff0000",
        };
        serde_json::json!({
            "attachments": [{
                "color": color,
                "title": alert.message,
                "fields": [
                    {"title": "Kind", "value": alert.kind, "short": true},
                    {"title": "Severity", "value": severity_label(alert.severity), "short": true},
                    {"title": "Process", "value": alert.process.as_deref().unwrap_or("system"), "short": true},
                    {"title": "Time", "value": alert.created_at.format("%Y-%m-%d %H:%M:%S").to_string(), "short": true},
                ],
            }],
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Build workers for every enabled sink. Misconfigured sinks are skipped
/// with a warning rather than refusing to boot the daemon.
pub fn build_sinks(cfg: &NotificationSettings) -> Vec<SinkWorker> {
    let mut workers = Vec::new();

    if cfg.email_enabled {
        match EmailSink::from_settings(cfg) {
            Ok(sink) => workers.push(SinkWorker::spawn(Arc::new(sink), SINK_QUEUE_CAPACITY)),
            Err(e) => tracing::warn!(error = %e, "email sink disabled"),
        }
    }
    if cfg.webhook_enabled {
        match WebhookSink::from_settings(cfg) {
            Ok(sink) => workers.push(SinkWorker::spawn(Arc::new(sink), SINK_QUEUE_CAPACITY)),
            Err(e) => tracing::warn!(error = %e, "webhook sink disabled"),
        }
    }
    if cfg.slack_enabled {
        match SlackSink::from_settings(cfg) {
            Ok(sink) => workers.push(SinkWorker::spawn(Arc::new(sink), SINK_QUEUE_CAPACITY)),
            Err(e) => tracing::warn!(error = %e, "slack sink disabled"),
        }
    }

    workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use procguard_types::AlertKind;
    use std::collections::BTreeMap;

    struct StallingSink;

    #[async_trait::async_trait]
    impl NotificationSink for StallingSink {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            // Never completes; keeps the queue from draining.
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn alert(severity: Severity, msg: &str) -> Alert {
        Alert {
            id: uuid::Uuid::new_v4(),
            kind: AlertKind::CpuHigh,
            severity,
            process: Some("p".to_string()),
            message: msg.to_string(),
            metadata: BTreeMap::new(),
            created_at: chrono::Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_critical_first() {
        let worker = SinkWorker::spawn(Arc::new(StallingSink), 2);
        // Give the worker a chance to pull the first alert off the queue.
        worker.enqueue(alert(Severity::Warning, "w0"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        worker.enqueue(alert(Severity::Warning, "w1"));
        worker.enqueue(alert(Severity::Critical, "c1"));
        worker.enqueue(alert(Severity::Critical, "c2"));

        let queued = worker.queued();
        let messages: Vec<&str> = queued.iter().map(|a| a.message.as_str()).collect();
        // w1 was evicted to make room; both criticals survive.
        assert_eq!(messages, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn overflow_never_drops_critical() {
        let worker = SinkWorker::spawn(Arc::new(StallingSink), 1);
        worker.enqueue(alert(Severity::Critical, "c0"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        worker.enqueue(alert(Severity::Critical, "c1"));
        worker.enqueue(alert(Severity::Critical, "c2"));
        worker.enqueue(alert(Severity::Warning, "w0"));

        let queued = worker.queued();
        assert!(queued.iter().all(|a| a.severity == Severity::Critical));
        assert_eq!(queued.len(), 2);
    }

    #[test]
    fn slack_payload_maps_severity_to_color() {
        let payload = SlackSink::payload(&alert(Severity::Critical, "boom"));
        assert_eq!(payload["attachments"][0]["color"], "#ff0000");
    }
}
