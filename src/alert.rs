//! Outbound alerts: recovery notifications and cleanup reports over HTTP.

use crate::reclaim::ReclamationReport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// JSON body posted after a recovery sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAlert {
    pub app: String,
    pub cpu: f64,
    pub ram_mb: u64,
    pub time: DateTime<Utc>,
    pub action: String,
}

/// What happened to an alert that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDelivery {
    Delivered,
    /// No endpoint configured; nothing was sent.
    Skipped,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_recovery(&self, alert: &RecoveryAlert) -> Result<AlertDelivery, AlertError>;
    async fn send_report(&self, report: &ReclamationReport) -> Result<AlertDelivery, AlertError>;
}

/// Posts JSON documents with `reqwest`.
pub struct HttpAlertSink {
    client: reqwest::Client,
    recovery_endpoint: Option<String>,
    report_endpoint: Option<String>,
}

impl HttpAlertSink {
    pub fn new(
        recovery_endpoint: Option<String>,
        report_endpoint: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Client { source: e })?;
        Ok(Self {
            client,
            recovery_endpoint: non_empty(recovery_endpoint),
            report_endpoint: non_empty(report_endpoint),
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        endpoint: Option<&str>,
        body: &T,
    ) -> Result<AlertDelivery, AlertError> {
        let Some(url) = endpoint else {
            tracing::info!("no alert endpoint configured, alert not sent");
            return Ok(AlertDelivery::Skipped);
        };

        tracing::debug!(url, "posting alert");
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AlertError::Transport {
                url: url.to_string(),
                source: e,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AlertError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(AlertDelivery::Delivered)
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn send_recovery(&self, alert: &RecoveryAlert) -> Result<AlertDelivery, AlertError> {
        self.post(self.recovery_endpoint.as_deref(), alert).await
    }

    async fn send_report(&self, report: &ReclamationReport) -> Result<AlertDelivery, AlertError> {
        self.post(self.report_endpoint.as_deref(), report).await
    }
}

fn non_empty(endpoint: Option<String>) -> Option<String> {
    endpoint.filter(|url| !url.trim().is_empty())
}

#[derive(Debug)]
pub enum AlertError {
    Client { source: reqwest::Error },
    Transport { url: String, source: reqwest::Error },
    Status { url: String, status: u16 },
}

impl std::fmt::Display for AlertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertError::Client { source } => write!(f, "failed to build http client: {source}"),
            AlertError::Transport { url, source } => {
                write!(f, "failed to post alert to {url}: {source}")
            }
            AlertError::Status { url, status } => {
                write!(f, "alert endpoint {url} returned status {status}")
            }
        }
    }
}

impl std::error::Error for AlertError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlertError::Client { source } => Some(source),
            AlertError::Transport { source, .. } => Some(source),
            AlertError::Status { .. } => None,
        }
    }
}
