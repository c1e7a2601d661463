//! Mutation Client Integration Tests
//!
//! Offline bundles, error classification, retry boundaries and idempotency.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use stagehand::clients::{
    CommitRequest, FileChange, MutationClient, MutationConfig, MutationError, MutationStatus,
    Operation, PullRequestRequest, RetryPolicy, SubmittedBundle, TransportError,
    DEFERRED_COMMIT_SHA, IDEMPOTENCY_HEADER,
};
use tempfile::TempDir;

use common::{ok, status, ScriptedTransport};

fn config(bundle_dir: PathBuf, offline: bool) -> MutationConfig {
    MutationConfig {
        base_url: "http://repo.test/".to_string(),
        token: Some("repo-token".to_string()),
        timeout: Duration::from_secs(5),
        health_timeout: Duration::from_secs(1),
        retry: RetryPolicy::immediate(3),
        offline,
        bundle_dir,
    }
}

fn commit_request() -> CommitRequest {
    CommitRequest {
        repo_url: "https://github.com/acme/docs".to_string(),
        base_branch: "main".to_string(),
        branch_name: "stagehand/run-1".to_string(),
        message: "Update generated report".to_string(),
        files: vec![FileChange {
            path: "reports/q3.md".to_string(),
            content: "# Q3\n".to_string(),
        }],
        author: None,
    }
}

fn pr_request() -> PullRequestRequest {
    PullRequestRequest {
        repo_url: "https://github.com/acme/docs".to_string(),
        head_branch: "stagehand/run-1".to_string(),
        base_branch: "main".to_string(),
        title: "Q3 report".to_string(),
        body: "Generated by run-1".to_string(),
        draft: false,
    }
}

const COMMIT_OK: &str = r#"{"commit_sha":"3f786850e387550fdab836ed7e6dc881de23001b","branch_name":"stagehand/run-1"}"#;

#[tokio::test]
async fn test_offline_commit_writes_bundle_without_network() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::always(ok(COMMIT_OK));
    let client = MutationClient::new(config(temp.path().join("bundles"), true), transport.clone());

    let result = client
        .create_commit(&commit_request(), Some("run-1:commit"))
        .await
        .unwrap();

    assert_eq!(transport.request_count(), 0);
    assert_eq!(result.status, MutationStatus::Deferred);
    assert_eq!(result.commit_sha, DEFERRED_COMMIT_SHA);
    assert_eq!(result.repo_url, "deferred://create_commit/run-1:commit");
    assert_eq!(result.idempotency_key, "run-1:commit");

    let bundles = client.list_bundles().await.unwrap();
    assert_eq!(bundles.len(), 1);
    assert_eq!(
        bundles[0].path,
        temp.path().join("bundles").join("create_commit-72756e2d313a636f6d6d6974.json")
    );
    assert_eq!(bundles[0].bundle.operation, Operation::CreateCommit);
    assert_eq!(bundles[0].bundle.idempotency_key, "run-1:commit");
    assert_eq!(
        bundles[0].bundle.payload,
        serde_json::to_value(commit_request()).unwrap()
    );
}

#[tokio::test]
async fn test_similar_keys_get_separate_bundles() {
    let temp = TempDir::new().unwrap();
    let client = MutationClient::new(
        config(temp.path().join("bundles"), true),
        ScriptedTransport::always(ok(COMMIT_OK)),
    );

    let mut second = commit_request();
    second.message = "Second change".to_string();
    client.create_commit(&commit_request(), Some("run-1:commit")).await.unwrap();
    client.create_commit(&second, Some("run-1/commit")).await.unwrap();

    let bundles = client.list_bundles().await.unwrap();
    assert_eq!(bundles.len(), 2);
    assert_ne!(bundles[0].path, bundles[1].path);

    let by_key = |key: &str| {
        bundles
            .iter()
            .find(|b| b.bundle.idempotency_key == key)
            .map(|b| b.bundle.payload["message"].clone())
            .unwrap()
    };
    assert_eq!(by_key("run-1:commit"), "Update generated report");
    assert_eq!(by_key("run-1/commit"), "Second change");
}

#[tokio::test]
async fn test_offline_pr_uses_sentinels() {
    let temp = TempDir::new().unwrap();
    let client = MutationClient::new(
        config(temp.path().join("bundles"), true),
        ScriptedTransport::always(ok("{}")),
    );

    let result = client.open_pr(&pr_request(), None).await.unwrap();

    assert_eq!(result.status, MutationStatus::Deferred);
    assert_eq!(result.pr_number, 0);
    assert_eq!(result.pr_url, format!("deferred://open_pr/{}", result.idempotency_key));
    assert_eq!(result.pr_html_url, result.pr_url);
    assert!(client.health_check().await.unwrap());
}

#[tokio::test]
async fn test_online_commit_sends_key_token_and_canonical_body() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![ok(COMMIT_OK)]);
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let result = client
        .create_commit(&commit_request(), Some("run-1:commit"))
        .await
        .unwrap();

    assert_eq!(result.status, MutationStatus::Completed);
    assert_eq!(result.commit_sha, "3f786850e387550fdab836ed7e6dc881de23001b");
    assert_eq!(result.repo_url, "https://github.com/acme/docs");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "http://repo.test/commit");
    assert_eq!(requests[0].header_value(IDEMPOTENCY_HEADER), Some("run-1:commit"));
    assert_eq!(requests[0].header_value("Authorization"), Some("Bearer repo-token"));

    let body = requests[0].body.as_deref().unwrap();
    assert!(body.starts_with("{\"base_branch\":\"main\",\"branch_name\""));
}

#[tokio::test]
async fn test_fresh_key_generated_per_call() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::always(ok(COMMIT_OK));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let first = client.create_commit(&commit_request(), None).await.unwrap();
    let second = client.create_commit(&commit_request(), None).await.unwrap();

    assert_ne!(first.idempotency_key, second.idempotency_key);
    assert_eq!(first.idempotency_key.len(), 36);
}

#[tokio::test]
async fn test_client_errors_are_classified_and_not_retried() {
    let cases = [
        (401, "{}", "auth_failed"),
        (403, "{}", "auth_failed"),
        (429, "{}", "rate_limited"),
        (409, r#"{"code":"branch_exists"}"#, "branch_conflict"),
        (422, r#"{"code":"branch_conflict"}"#, "branch_conflict"),
        (400, r#"{"code":"bad_path"}"#, "client_error"),
    ];

    for (code, body, expected) in cases {
        let temp = TempDir::new().unwrap();
        let transport = ScriptedTransport::always(status(code, body));
        let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

        let err = client.create_commit(&commit_request(), Some("k")).await.unwrap_err();

        assert_eq!(err.code(), expected, "status {}", code);
        assert_eq!(err.status(), Some(code));
        assert_eq!(err.body(), Some(body));
        assert!(!err.is_retryable());
        assert_eq!(transport.request_count(), 1, "status {} was retried", code);
    }
}

#[tokio::test]
async fn test_server_errors_exhaust_retries_with_stable_key() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::always(status(502, "bad gateway"));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let err = client.open_pr(&pr_request(), Some("run-1:pr")).await.unwrap_err();

    match &err {
        MutationError::Service { status, attempts, .. } => {
            assert_eq!(*status, 502);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected service error, got {:?}", other),
    }
    assert_eq!(err.code(), "service_error");

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests
        .iter()
        .all(|r| r.header_value(IDEMPOTENCY_HEADER) == Some("run-1:pr")));
    assert!(requests.iter().all(|r| r.body == requests[0].body));
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout(Duration::from_secs(5))),
        status(503, "busy"),
        ok(r#"{"pr_number":42,"pr_url":"https://api.github.com/repos/acme/docs/pulls/42","pr_html_url":"https://github.com/acme/docs/pull/42"}"#),
    ]);
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let result = client.open_pr(&pr_request(), Some("run-1:pr")).await.unwrap();

    assert_eq!(result.pr_number, 42);
    assert_eq!(result.pr_html_url, "https://github.com/acme/docs/pull/42");
    assert_eq!(result.status, MutationStatus::Completed);
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_timeouts_surface_after_exhaustion() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::always(Err(TransportError::Timeout(Duration::from_secs(5))));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let err = client.create_commit(&commit_request(), None).await.unwrap_err();

    assert!(matches!(err, MutationError::Timeout { attempts: 3 }));
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_invalid_success_body_is_not_retried() {
    let temp = TempDir::new().unwrap();
    let transport = ScriptedTransport::always(ok("<html>ok</html>"));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), transport.clone());

    let err = client.create_commit(&commit_request(), None).await.unwrap_err();

    assert_eq!(err.code(), "invalid_response");
    assert_eq!(err.body(), Some("<html>ok</html>"));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_health_check() {
    let temp = TempDir::new().unwrap();

    let healthy = ScriptedTransport::always(ok("ok"));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), healthy.clone());
    assert!(client.health_check().await.unwrap());
    let health_request = &healthy.requests()[0];
    assert_eq!(health_request.url, "http://repo.test/health");
    assert_eq!(health_request.timeout, Duration::from_secs(1));

    let unhealthy = ScriptedTransport::always(status(503, ""));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), unhealthy);
    assert!(!client.health_check().await.unwrap());

    let down = ScriptedTransport::always(Err(TransportError::Connect("refused".to_string())));
    let client = MutationClient::new(config(temp.path().to_path_buf(), false), down);
    let err = client.health_check().await.unwrap_err();
    assert_eq!(err.code(), "unreachable");
}

#[tokio::test]
async fn test_submit_bundle_reuses_original_key() {
    let temp = TempDir::new().unwrap();
    let bundle_dir = temp.path().join("bundles");

    let offline = MutationClient::new(config(bundle_dir.clone(), true), ScriptedTransport::always(ok("{}")));
    offline
        .create_commit(&commit_request(), Some("run-1:commit"))
        .await
        .unwrap();
    let bundle = offline.list_bundles().await.unwrap().remove(0);

    assert!(matches!(
        offline.submit_bundle(&bundle.path).await,
        Err(MutationError::Offline)
    ));

    let transport = ScriptedTransport::new(vec![ok(COMMIT_OK)]);
    let online = MutationClient::new(config(bundle_dir.clone(), false), transport.clone());
    let submitted = online.submit_bundle(&bundle.path).await.unwrap();

    match submitted {
        SubmittedBundle::Commit(result) => {
            assert_eq!(result.idempotency_key, "run-1:commit");
            assert_eq!(result.status, MutationStatus::Completed);
        }
        other => panic!("expected commit, got {:?}", other),
    }

    let request = &transport.requests()[0];
    assert_eq!(request.header_value(IDEMPOTENCY_HEADER), Some("run-1:commit"));
    let body: Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, serde_json::to_value(commit_request()).unwrap());

    assert!(!bundle.path.exists());
    assert!(online.list_bundles().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_submission_keeps_bundle() {
    let temp = TempDir::new().unwrap();
    let bundle_dir = temp.path().join("bundles");

    let offline = MutationClient::new(config(bundle_dir.clone(), true), ScriptedTransport::always(ok("{}")));
    offline.open_pr(&pr_request(), Some("run-1:pr")).await.unwrap();
    let bundle = offline.list_bundles().await.unwrap().remove(0);

    let online = MutationClient::new(
        config(bundle_dir, false),
        ScriptedTransport::always(status(409, "exists")),
    );
    let err = online.submit_bundle(&bundle.path).await.unwrap_err();

    assert_eq!(err.code(), "branch_conflict");
    assert!(bundle.path.exists());
}
