//! Idempotent remote-mutation client.
//!
//! Wraps the repository service that creates commits and opens pull
//! requests. Every mutating call carries an idempotency key (supplied by the
//! caller or generated fresh) that is sent unchanged on every retry, so the
//! service can recognise repeats.
//!
//! In offline mode nothing is sent: the request is written as an
//! [`OfflineBundle`] and a `deferred` result with sentinel identifiers is
//! returned. [`MutationClient::submit_bundle`] replays a bundle later with
//! its original key.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, IDEMPOTENCY_HEADER};
use crate::core::atomic::{atomic_write, remove_if_exists};
use crate::core::canonical::to_canonical_string;
use crate::domain::now_timestamp;

/// Commit SHA reported for deferred commits
pub const DEFERRED_COMMIT_SHA: &str = "0000000000000000000000000000000000000000";

/// Mutation client settings
#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub base_url: String,
    pub token: Option<String>,

    /// Per-request timeout for mutating calls
    pub timeout: Duration,

    /// Timeout for the health check
    pub health_timeout: Duration,

    pub retry: RetryPolicy,

    /// Write bundles instead of calling the service
    pub offline: bool,

    /// Where offline bundles are written
    pub bundle_dir: PathBuf,
}

/// A single file in a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub repo_url: String,
    pub base_branch: String,
    pub branch_name: String,
    pub message: String,
    pub files: Vec<FileChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRequest {
    pub repo_url: String,
    pub head_branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Completed,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResult {
    pub commit_sha: String,
    pub branch_name: String,
    pub repo_url: String,
    pub status: MutationStatus,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestResult {
    pub pr_number: u64,
    pub pr_url: String,
    pub pr_html_url: String,
    pub status: MutationStatus,
    pub idempotency_key: String,
}

/// Mutating operations understood by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateCommit,
    OpenPr,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateCommit => "create_commit",
            Operation::OpenPr => "open_pr",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Operation::CreateCommit => "/commit",
            Operation::OpenPr => "/open_pr",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation recorded while offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineBundle {
    pub operation: Operation,
    pub idempotency_key: String,
    /// The request as it would have been sent
    pub payload: Value,
    pub timestamp: String,
}

/// A bundle file found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredBundle {
    pub path: PathBuf,
    pub bundle: OfflineBundle,
}

/// Result of re-issuing a deferred bundle
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedBundle {
    Commit(CommitResult),
    PullRequest(PullRequestResult),
}

/// Mutation client failures
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("rate limited: {body}")]
    RateLimited { body: String },

    #[error("branch conflict ({status}): {body}")]
    BranchConflict { status: u16, body: String },

    #[error("request rejected ({status}): {body}")]
    Client {
        status: u16,
        body: String,
        /// Service-supplied error code, if any
        code: Option<String>,
    },

    #[error("service error ({status}) after {attempts} attempts: {body}")]
    Service { status: u16, body: String, attempts: u32 },

    #[error("request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("network error after {attempts} attempts: {message}")]
    Network { message: String, attempts: u32 },

    #[error("service unreachable: {message}")]
    Unreachable { message: String },

    #[error("invalid response ({status}): {message}")]
    InvalidResponse {
        status: u16,
        body: String,
        message: String,
    },

    #[error("operation requires the remote service but the client is offline")]
    Offline,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MutationError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            MutationError::Auth { .. } => "auth_failed",
            MutationError::RateLimited { .. } => "rate_limited",
            MutationError::BranchConflict { .. } => "branch_conflict",
            MutationError::Client { .. } => "client_error",
            MutationError::Service { .. } => "service_error",
            MutationError::Timeout { .. } => "timeout",
            MutationError::Network { .. } => "network_error",
            MutationError::Unreachable { .. } => "unreachable",
            MutationError::InvalidResponse { .. } => "invalid_response",
            MutationError::Offline => "offline",
            MutationError::Io(_) => "io_error",
            MutationError::Serialization(_) => "serialization_error",
        }
    }

    /// HTTP status, when the service answered
    pub fn status(&self) -> Option<u16> {
        match self {
            MutationError::Auth { status, .. }
            | MutationError::BranchConflict { status, .. }
            | MutationError::Client { status, .. }
            | MutationError::Service { status, .. }
            | MutationError::InvalidResponse { status, .. } => Some(*status),
            MutationError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Response body, when the service answered
    pub fn body(&self) -> Option<&str> {
        match self {
            MutationError::Auth { body, .. }
            | MutationError::RateLimited { body }
            | MutationError::BranchConflict { body, .. }
            | MutationError::Client { body, .. }
            | MutationError::Service { body, .. }
            | MutationError::InvalidResponse { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MutationError::Service { .. } | MutationError::Timeout { .. } | MutationError::Network { .. }
        )
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    commit_sha: String,
    #[serde(default)]
    branch_name: Option<String>,
    #[serde(default)]
    repo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    pr_number: u64,
    pr_url: String,
    #[serde(default)]
    pr_html_url: Option<String>,
}

/// Client for the repository mutation service
pub struct MutationClient {
    config: MutationConfig,
    transport: Arc<dyn HttpTransport>,
}

impl MutationClient {
    pub fn new(config: MutationConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self { config, transport }
    }

    pub fn is_offline(&self) -> bool {
        self.config.offline
    }

    /// Create a commit on a new branch
    #[instrument(skip(self, request, idempotency_key), fields(repo = %request.repo_url, branch = %request.branch_name))]
    pub async fn create_commit(
        &self,
        request: &CommitRequest,
        idempotency_key: Option<&str>,
    ) -> Result<CommitResult, MutationError> {
        let key = resolve_key(idempotency_key);

        if self.config.offline {
            self.write_bundle(Operation::CreateCommit, &key, request).await?;
            return Ok(CommitResult {
                commit_sha: DEFERRED_COMMIT_SHA.to_string(),
                branch_name: request.branch_name.clone(),
                repo_url: deferred_url(Operation::CreateCommit, &key),
                status: MutationStatus::Deferred,
                idempotency_key: key,
            });
        }

        self.commit_online(request, key).await
    }

    /// Open a pull request
    #[instrument(skip(self, request, idempotency_key), fields(repo = %request.repo_url, head = %request.head_branch))]
    pub async fn open_pr(
        &self,
        request: &PullRequestRequest,
        idempotency_key: Option<&str>,
    ) -> Result<PullRequestResult, MutationError> {
        let key = resolve_key(idempotency_key);

        if self.config.offline {
            self.write_bundle(Operation::OpenPr, &key, request).await?;
            let url = deferred_url(Operation::OpenPr, &key);
            return Ok(PullRequestResult {
                pr_number: 0,
                pr_url: url.clone(),
                pr_html_url: url,
                status: MutationStatus::Deferred,
                idempotency_key: key,
            });
        }

        self.open_pr_online(request, key).await
    }

    /// Check the service is reachable. Offline clients always report healthy.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<bool, MutationError> {
        if self.config.offline {
            return Ok(true);
        }

        let request = HttpRequest::new(Method::GET, self.url("/health"), self.config.health_timeout)
            .bearer(self.config.token.as_deref());

        match self.transport.send(request).await {
            Ok(response) => {
                debug!(status = response.status, "Health check answered");
                Ok(response.is_success())
            }
            Err(err) => Err(MutationError::Unreachable {
                message: err.to_string(),
            }),
        }
    }

    /// Deferred bundles waiting in the bundle directory, ordered by path
    pub async fn list_bundles(&self) -> Result<Vec<DeferredBundle>, MutationError> {
        let mut dir = match fs::read_dir(&self.config.bundle_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut bundles = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_bundle(&path).await {
                Ok(bundle) => bundles.push(DeferredBundle { path, bundle }),
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable bundle"),
            }
        }

        bundles.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(bundles)
    }

    /// Re-issue a deferred bundle with its original key, then delete it
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn submit_bundle(&self, path: &Path) -> Result<SubmittedBundle, MutationError> {
        if self.config.offline {
            return Err(MutationError::Offline);
        }

        let bundle = read_bundle(path).await?;
        let key = bundle.idempotency_key.clone();

        let submitted = match bundle.operation {
            Operation::CreateCommit => {
                let request: CommitRequest = serde_json::from_value(bundle.payload)?;
                SubmittedBundle::Commit(self.commit_online(&request, key).await?)
            }
            Operation::OpenPr => {
                let request: PullRequestRequest = serde_json::from_value(bundle.payload)?;
                SubmittedBundle::PullRequest(self.open_pr_online(&request, key).await?)
            }
        };

        remove_if_exists(path).await?;
        info!(operation = %bundle.operation, "Submitted deferred bundle");
        Ok(submitted)
    }

    async fn commit_online(
        &self,
        request: &CommitRequest,
        key: String,
    ) -> Result<CommitResult, MutationError> {
        let response: CommitResponse = self.send_mutation(Operation::CreateCommit, &key, request).await?;
        Ok(CommitResult {
            commit_sha: response.commit_sha,
            branch_name: response
                .branch_name
                .unwrap_or_else(|| request.branch_name.clone()),
            repo_url: response.repo_url.unwrap_or_else(|| request.repo_url.clone()),
            status: MutationStatus::Completed,
            idempotency_key: key,
        })
    }

    async fn open_pr_online(
        &self,
        request: &PullRequestRequest,
        key: String,
    ) -> Result<PullRequestResult, MutationError> {
        let response: PullRequestResponse = self.send_mutation(Operation::OpenPr, &key, request).await?;
        Ok(PullRequestResult {
            pr_number: response.pr_number,
            pr_html_url: response.pr_html_url.unwrap_or_else(|| response.pr_url.clone()),
            pr_url: response.pr_url,
            status: MutationStatus::Completed,
            idempotency_key: key,
        })
    }

    async fn send_mutation<B, R>(
        &self,
        operation: Operation,
        key: &str,
        body: &B,
    ) -> Result<R, MutationError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let body = to_canonical_string(body)?;
        let url = self.url(operation.path());
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let request = HttpRequest::new(Method::POST, url.clone(), self.config.timeout)
                .bearer(self.config.token.as_deref())
                .header(IDEMPOTENCY_HEADER, key)
                .json_body(body.clone());

            let err = match self.transport.send(request).await {
                Ok(response) if response.is_success() => return parse_success(response),
                Ok(response) => classify_status(response, attempt),
                Err(err) => classify_transport(err, attempt),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if !self.config.retry.should_retry(attempt) {
                warn!(%operation, attempt, error = %err, "Mutation failed; retries exhausted");
                return Err(err);
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(
                %operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Mutation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn write_bundle<B: Serialize>(
        &self,
        operation: Operation,
        key: &str,
        request: &B,
    ) -> Result<PathBuf, MutationError> {
        let bundle = OfflineBundle {
            operation,
            idempotency_key: key.to_string(),
            payload: serde_json::to_value(request)?,
            timestamp: now_timestamp(),
        };

        let path = self
            .config
            .bundle_dir
            .join(bundle_file_name(operation, key));
        let mut bytes = serde_json::to_vec_pretty(&bundle)?;
        bytes.push(b'\n');
        atomic_write(&path, bytes).await?;

        info!(%operation, path = %path.display(), "Offline: mutation deferred to bundle");
        Ok(path)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

fn resolve_key(supplied: Option<&str>) -> String {
    match supplied {
        Some(key) => key.to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

fn deferred_url(operation: Operation, key: &str) -> String {
    format!("deferred://{}/{}", operation, key)
}

/// Bundle file name for a mutation. The key is hex-encoded so distinct keys
/// never share a file.
fn bundle_file_name(operation: Operation, key: &str) -> String {
    format!("{}-{}.json", operation, hex::encode(key.as_bytes()))
}

async fn read_bundle(path: &Path) -> Result<OfflineBundle, MutationError> {
    let contents = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

fn parse_success<R: DeserializeOwned>(response: HttpResponse) -> Result<R, MutationError> {
    serde_json::from_str(&response.body).map_err(|err| MutationError::InvalidResponse {
        status: response.status,
        message: err.to_string(),
        body: response.body,
    })
}

fn classify_status(response: HttpResponse, attempt: u32) -> MutationError {
    let HttpResponse { status, body } = response;

    if (500..600).contains(&status) {
        return MutationError::Service {
            status,
            body,
            attempts: attempt,
        };
    }

    let code = error_code(&body);
    match status {
        401 | 403 => MutationError::Auth { status, body },
        429 => MutationError::RateLimited { body },
        409 => MutationError::BranchConflict { status, body },
        _ if matches!(code.as_deref(), Some("branch_conflict" | "branch_exists")) => {
            MutationError::BranchConflict { status, body }
        }
        _ if (400..500).contains(&status) => MutationError::Client { status, body, code },
        _ => MutationError::InvalidResponse {
            status,
            message: format!("unexpected status {}", status),
            body,
        },
    }
}

fn classify_transport(err: TransportError, attempt: u32) -> MutationError {
    match err {
        TransportError::Timeout(_) => MutationError::Timeout { attempts: attempt },
        TransportError::Connect(message) | TransportError::Other(message) => MutationError::Network {
            message,
            attempts: attempt,
        },
    }
}

/// Service error code from `{"code": ..}` or `{"error": {"code": ..}}`
fn error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("code")
        .or_else(|| value.get("error").and_then(|e| e.get("code")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        let codes = [
            (401, "{}", "auth_failed"),
            (403, "{}", "auth_failed"),
            (429, "{}", "rate_limited"),
            (409, "{}", "branch_conflict"),
            (422, r#"{"code":"branch_exists"}"#, "branch_conflict"),
            (422, r#"{"error":{"code":"branch_conflict"}}"#, "branch_conflict"),
            (400, "bad", "client_error"),
            (503, "down", "service_error"),
        ];

        for (status, body, expected) in codes {
            let err = classify_status(HttpResponse::new(status, body), 1);
            assert_eq!(err.code(), expected, "status {}", status);
            assert_eq!(err.status(), Some(status));
            assert_eq!(err.body(), Some(body));
        }
    }

    #[test]
    fn test_client_error_keeps_service_code() {
        match classify_status(HttpResponse::new(400, r#"{"code":"bad_path"}"#), 1) {
            MutationError::Client { code, .. } => assert_eq!(code.as_deref(), Some("bad_path")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_classes() {
        assert!(MutationError::Timeout { attempts: 1 }.is_retryable());
        assert!(classify_transport(TransportError::Connect("refused".into()), 1).is_retryable());
        assert!(!classify_status(HttpResponse::new(404, ""), 1).is_retryable());
    }

    #[test]
    fn test_bundle_file_name_is_injective() {
        assert_eq!(
            bundle_file_name(Operation::CreateCommit, "k1"),
            "create_commit-6b31.json"
        );
        assert_ne!(
            bundle_file_name(Operation::OpenPr, "run-1:stage"),
            bundle_file_name(Operation::OpenPr, "run-1/stage")
        );
        assert_ne!(
            bundle_file_name(Operation::OpenPr, "a_b"),
            bundle_file_name(Operation::OpenPr, "a.b")
        );
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::CreateCommit.to_string(), "create_commit");
        assert_eq!(
            serde_json::to_value(Operation::OpenPr).unwrap(),
            Value::String("open_pr".to_string())
        );
        assert_eq!(serde_json::to_value(MutationStatus::Deferred).unwrap(), "deferred");
    }
}
