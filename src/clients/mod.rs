//! Outbound clients.
//!
//! - TelemetryReporter: at-least-once status reporting with an outbox fallback
//! - MutationClient: idempotent commit/PR creation with offline bundles
//! - HttpTransport: the HTTP seam both clients are built on
//! - RetryPolicy: bounded backoff shared by both

pub mod mutation;
pub mod outbox;
pub mod reporter;
pub mod retry;
pub mod transport;

pub use mutation::{
    CommitRequest, CommitResult, DeferredBundle, FileChange, MutationClient, MutationConfig,
    MutationError, MutationStatus, OfflineBundle, Operation, PullRequestRequest,
    PullRequestResult, SubmittedBundle, DEFERRED_COMMIT_SHA,
};
pub use outbox::{Outbox, OutboxContents, OutboxEntry, OutboxError};
pub use reporter::{
    CommitAssociation, FlushSummary, ReportOutcome, ReporterConfig, RunOpened, StatusUpdate,
    TelemetryRecord, TelemetryReporter,
};
pub use retry::RetryPolicy;
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError, IDEMPOTENCY_HEADER,
};
