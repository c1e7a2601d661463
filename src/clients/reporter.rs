//! Telemetry reporter with an outbox fallback.
//!
//! Sends run status records to the local telemetry collector. Delivery is
//! at-least-once: a record that cannot be delivered after bounded retry is
//! buffered in the [`Outbox`] and re-sent by [`TelemetryReporter::flush_outbox`].
//! Every record carries a caller-supplied idempotency key so redelivery is
//! safe server-side; the client does no local deduplication.
//!
//! `report` never fails: telemetry trouble must not fail the pipeline.
//!
//! Endpoints:
//! - `POST  /api/v1/runs`
//! - `PATCH /api/v1/runs/{event_id}`
//! - `POST  /api/v1/runs/{event_id}/associate-commit`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::outbox::{Outbox, OutboxEntry, OutboxError};
use super::retry::RetryPolicy;
use super::transport::{HttpRequest, HttpTransport, TransportError, IDEMPOTENCY_HEADER};
use crate::core::canonical::canonical_json;
use crate::domain::now_timestamp;

/// Reporter settings
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Collector base URL, e.g. `http://127.0.0.1:8765`
    pub base_url: String,

    /// Optional bearer token
    pub token: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,

    pub retry: RetryPolicy,

    pub outbox_path: PathBuf,

    /// Outbox size ceiling in bytes
    pub max_outbox_bytes: u64,
}

/// A run-status record for the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryRecord {
    RunOpened(RunOpened),
    StatusUpdate(StatusUpdate),
    CommitAssociated(CommitAssociation),
}

/// Creates the collector-side record for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOpened {
    /// Collector record id used by later updates
    pub event_id: String,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Updates an existing run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub event_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

/// Links a run record to the commit/PR it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitAssociation {
    pub event_id: String,
    pub commit_sha: String,
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

impl TelemetryRecord {
    pub fn method(&self) -> Method {
        match self {
            TelemetryRecord::RunOpened(_) | TelemetryRecord::CommitAssociated(_) => Method::POST,
            TelemetryRecord::StatusUpdate(_) => Method::PATCH,
        }
    }

    pub fn endpoint(&self) -> String {
        match self {
            TelemetryRecord::RunOpened(_) => "/api/v1/runs".to_string(),
            // Event ids come from callers, so they are encoded as one path segment
            TelemetryRecord::StatusUpdate(update) => {
                format!("/api/v1/runs/{}", urlencoding::encode(&update.event_id))
            }
            TelemetryRecord::CommitAssociated(assoc) => format!(
                "/api/v1/runs/{}/associate-commit",
                urlencoding::encode(&assoc.event_id)
            ),
        }
    }

    /// Request body: the record's fields plus `idempotency_key`
    pub fn payload(&self, idempotency_key: &str) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "idempotency_key".to_string(),
                Value::String(idempotency_key.to_string()),
            );
        }
        Ok(value)
    }
}

/// What happened to a reported record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The collector accepted it
    Delivered,

    /// Delivery failed; the record is in the outbox
    Buffered,

    /// Delivery failed and the outbox could not be written either
    Dropped { reason: String },
}

/// Result of one outbox flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Unparsable entries removed from the outbox
    pub discarded: usize,
}

#[derive(Debug, Error)]
enum DeliveryError {
    #[error("collector rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("collector error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeliveryError {
    fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Rejected { .. })
    }
}

/// Telemetry client; owns its outbox file exclusively
pub struct TelemetryReporter {
    config: ReporterConfig,
    transport: Arc<dyn HttpTransport>,
    outbox: Outbox,
    outbox_guard: Mutex<()>,
}

impl TelemetryReporter {
    pub fn new(config: ReporterConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let outbox = Outbox::new(config.outbox_path.clone(), config.max_outbox_bytes);
        Self {
            config,
            transport,
            outbox,
            outbox_guard: Mutex::new(()),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Deliver a record, buffering it on failure. Never returns an error.
    #[instrument(skip(self, record, idempotency_key), fields(endpoint = %record.endpoint(), key = %idempotency_key))]
    pub async fn report(&self, record: &TelemetryRecord, idempotency_key: &str) -> ReportOutcome {
        let payload = match record.payload(idempotency_key) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "Failed to encode telemetry record; dropping");
                return ReportOutcome::Dropped {
                    reason: err.to_string(),
                };
            }
        };
        let method = record.method();
        let endpoint = record.endpoint();

        match self.send_with_retry(&method, &endpoint, &payload).await {
            Ok(()) => {
                debug!("Telemetry delivered");
                ReportOutcome::Delivered
            }
            Err(err) => {
                warn!(error = %err, "Telemetry delivery failed; buffering to outbox");
                self.buffer(&method, endpoint, payload).await
            }
        }
    }

    /// Attempt each buffered entry once; keep the failures, in order.
    #[instrument(skip(self))]
    pub async fn flush_outbox(&self) -> Result<FlushSummary, OutboxError> {
        let _guard = self.outbox_guard.lock().await;
        let loaded = self.outbox.load().await?;

        let mut summary = FlushSummary {
            discarded: loaded.discarded,
            ..Default::default()
        };
        let mut remaining = Vec::new();

        for entry in loaded.entries {
            let method = match Method::from_bytes(entry.method.as_bytes()) {
                Ok(method) => method,
                Err(_) => {
                    warn!(method = %entry.method, "Discarding outbox entry with invalid method");
                    summary.discarded += 1;
                    continue;
                }
            };

            match self.send_once(&method, &entry.endpoint, &entry.payload).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    debug!(endpoint = %entry.endpoint, error = %err, "Outbox entry still undeliverable");
                    summary.failed += 1;
                    remaining.push(entry);
                }
            }
        }

        self.outbox.replace(&remaining).await?;

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            discarded = summary.discarded,
            "Flushed telemetry outbox"
        );
        Ok(summary)
    }

    /// Entries currently waiting in the outbox
    pub async fn pending(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let _guard = self.outbox_guard.lock().await;
        Ok(self.outbox.load().await?.entries)
    }

    async fn buffer(&self, method: &Method, endpoint: String, payload: Value) -> ReportOutcome {
        let entry = OutboxEntry {
            endpoint,
            method: method.as_str().to_string(),
            payload,
            timestamp: now_timestamp(),
        };

        let _guard = self.outbox_guard.lock().await;
        match self.outbox.push(&entry).await {
            Ok(()) => ReportOutcome::Buffered,
            Err(err) => {
                error!(error = %err, path = %self.outbox.path().display(), "Failed to buffer telemetry; record lost");
                ReportOutcome::Dropped {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn send_with_retry(
        &self,
        method: &Method,
        endpoint: &str,
        payload: &Value,
    ) -> Result<(), DeliveryError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match self.send_once(method, endpoint, payload).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if err.is_permanent() || !self.config.retry.should_retry(attempt) {
                return Err(err);
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Telemetry delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        endpoint: &str,
        payload: &Value,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let mut request = HttpRequest::new(method.clone(), url, self.config.timeout)
            .bearer(self.config.token.as_deref())
            .json_body(canonical_json(payload));
        if let Some(key) = payload.get("idempotency_key").and_then(Value::as_str) {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(())
        } else if response.is_client_error() {
            Err(DeliveryError::Rejected {
                status: response.status,
                body: response.body,
            })
        } else {
            Err(DeliveryError::Server {
                status: response.status,
                body: response.body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> TelemetryRecord {
        TelemetryRecord::StatusUpdate(StatusUpdate {
            event_id: "evt-9".to_string(),
            status: "RUNNING".to_string(),
            stage: Some("extract".to_string()),
            message: None,
            progress: Some(0.5),
            finished_at: None,
        })
    }

    #[test]
    fn test_endpoints_and_methods() {
        let opened = TelemetryRecord::RunOpened(RunOpened {
            event_id: "evt-9".to_string(),
            run_id: "run-1".to_string(),
            status: "RUNNING".to_string(),
            started_at: now_timestamp(),
            pipeline: None,
            metadata: Map::new(),
        });
        assert_eq!(opened.endpoint(), "/api/v1/runs");
        assert_eq!(opened.method(), Method::POST);

        assert_eq!(update().endpoint(), "/api/v1/runs/evt-9");
        assert_eq!(update().method(), Method::PATCH);

        let assoc = TelemetryRecord::CommitAssociated(CommitAssociation {
            event_id: "evt-9".to_string(),
            commit_sha: "abc".to_string(),
            repo_url: "https://github.com/o/r".to_string(),
            branch_name: None,
            pr_url: None,
        });
        assert_eq!(assoc.endpoint(), "/api/v1/runs/evt-9/associate-commit");
    }

    #[test]
    fn test_event_id_is_one_encoded_segment() {
        let update = TelemetryRecord::StatusUpdate(StatusUpdate {
            event_id: "a/b?c#d e".to_string(),
            status: "RUNNING".to_string(),
            stage: None,
            message: None,
            progress: None,
            finished_at: None,
        });
        assert_eq!(update.endpoint(), "/api/v1/runs/a%2Fb%3Fc%23d%20e");

        let assoc = TelemetryRecord::CommitAssociated(CommitAssociation {
            event_id: "../admin".to_string(),
            commit_sha: "abc".to_string(),
            repo_url: "https://github.com/o/r".to_string(),
            branch_name: None,
            pr_url: None,
        });
        assert_eq!(assoc.endpoint(), "/api/v1/runs/..%2Fadmin/associate-commit");
    }

    #[test]
    fn test_payload_carries_idempotency_key() {
        let payload = update().payload("run-1:extract:status:3").unwrap();
        assert_eq!(payload["idempotency_key"], "run-1:extract:status:3");
        assert_eq!(payload["status"], "RUNNING");
        assert!(payload.get("message").is_none());
    }
}
