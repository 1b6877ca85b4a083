//! Alert publishing: HIGH_RISK transactions, exhausted dead letters, unreachable shards.
//!
//! Delivery is fire-and-forget. A failed publish is logged and counted, never
//! propagated into the pipeline.

use crate::metrics::PipelineMetrics;
use crate::types::alert::Alert;
use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Destination for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Publishes alerts as JSON to a NATS subject
#[derive(Clone)]
pub struct NatsAlertSink {
    client: Client,
    subject: String,
}

impl NatsAlertSink {
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl AlertSink for NatsAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_vec(alert)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(
            alert_id = %alert.alert_id,
            kind = alert.kind.as_str(),
            subject = %alert.subject,
            "Published alert"
        );

        Ok(())
    }
}

/// Writes alerts to the log only; used when no broker is configured
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        warn!(
            alert_id = %alert.alert_id,
            kind = alert.kind.as_str(),
            subject = %alert.subject,
            risk_score = ?alert.risk_score,
            triggered = ?alert.triggered_features,
            message = %alert.message,
            "ALERT"
        );
        Ok(())
    }
}

/// Keeps alerts in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every alert received so far
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))?
            .push(alert.clone());
        Ok(())
    }
}

/// Sends alerts to a sink under a timeout, swallowing failures
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    timeout: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, timeout: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            sink,
            timeout,
            metrics,
        }
    }

    /// Deliver an alert. Returns whether the sink accepted it.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        self.metrics.record_alert(alert.kind);

        match tokio::time::timeout(self.timeout, self.sink.notify(&alert)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(
                    alert_id = %alert.alert_id,
                    kind = alert.kind.as_str(),
                    error = %e,
                    "Failed to publish alert"
                );
                self.metrics.record_alert_failure();
                false
            }
            Err(_) => {
                error!(
                    alert_id = %alert.alert_id,
                    kind = alert.kind.as_str(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Alert publish timed out"
                );
                self.metrics.record_alert_failure();
                false
            }
        }
    }
}
