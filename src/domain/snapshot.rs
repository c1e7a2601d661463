//! Run snapshot and its reducer.
//!
//! A snapshot is a cache: it is always reproducible by folding the run's
//! event log, in order, starting from [`Snapshot::initial`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::events::{Event, EventPayload};

/// Current snapshot schema version. Increment on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Projection of a run's event log at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,

    pub run_id: String,

    pub run_state: RunState,

    /// Artifact name -> latest write
    pub artifacts_index: BTreeMap<String, ArtifactIndexEntry>,

    /// Work items in queue order
    pub work_items: Vec<WorkItem>,

    pub issues: Vec<Issue>,

    /// Section name -> state
    pub section_states: BTreeMap<String, String>,

    /// Id of the last event folded into this snapshot
    pub last_event_id: Option<String>,

    /// Number of events folded into this snapshot
    pub events_applied: u64,
}

/// Lifecycle state of a run.
///
/// Names outside the known set are kept verbatim in `Other` so logs from
/// newer producers still replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunState {
    Created,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
    Other(String),
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Created => "CREATED",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
            RunState::Other(name) => name,
        }
    }
}

impl From<String> for RunState {
    fn from(name: String) -> Self {
        match name.as_str() {
            "CREATED" => RunState::Created,
            "RUNNING" => RunState::Running,
            "PAUSED" => RunState::Paused,
            "SUCCEEDED" => RunState::Succeeded,
            "FAILED" => RunState::Failed,
            "CANCELLED" => RunState::Cancelled,
            _ => RunState::Other(name),
        }
    }
}

impl From<RunState> for String {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Created
    }
}

/// One unit of work handed to a worker stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_item_id: String,
    pub worker: String,
    pub attempt: u32,
    pub status: WorkItemStatus,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub scope_key: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Queued,
    Running,
    Finished,
}

/// A problem raised by a stage (validation failure, missing fact, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,

    #[serde(default)]
    pub status: IssueStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,

    /// Producer-specific fields, preserved as-is
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Issue {
    /// Create an open issue
    pub fn new(issue_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            status: IssueStatus::Open,
            severity: None,
            message: Some(message.into()),
            resolved_at: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Open,
    Resolved,
}

impl Default for IssueStatus {
    fn default() -> Self {
        Self::Open
    }
}

/// Latest recorded write of a named artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndexEntry {
    pub path: String,
    pub sha256: String,
    pub schema_id: String,
    pub writer_worker: String,
    /// Timestamp of the ARTIFACT_WRITTEN event
    pub ts: String,
    /// Id of the ARTIFACT_WRITTEN event
    pub event_id: String,
}

/// Errors raised while folding an event into a snapshot
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("event {event_id} ({event_type}) has a malformed payload: {source}")]
    MalformedPayload {
        event_id: String,
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Snapshot {
    /// Empty snapshot for a run that has not seen any events
    pub fn initial(run_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.into(),
            run_state: RunState::Created,
            artifacts_index: BTreeMap::new(),
            work_items: Vec::new(),
            issues: Vec::new(),
            section_states: BTreeMap::new(),
            last_event_id: None,
            events_applied: 0,
        }
    }

    /// Fold one event into the snapshot.
    ///
    /// Unrecognized event types and lookups of unknown ids are no-ops.
    pub fn apply(mut self, event: &Event) -> Result<Self, ApplyError> {
        let payload = event
            .decode_payload()
            .map_err(|source| ApplyError::MalformedPayload {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                source,
            })?;

        match payload {
            EventPayload::RunCreated(_) | EventPayload::GateRunFinished(_) => {}
            EventPayload::RunStateChanged(change) => {
                self.run_state = change.new_state;
            }
            EventPayload::ArtifactWritten(artifact) => {
                self.artifacts_index.insert(
                    artifact.name,
                    ArtifactIndexEntry {
                        path: artifact.path,
                        sha256: artifact.sha256,
                        schema_id: artifact.schema_id,
                        writer_worker: artifact.writer_worker,
                        ts: event.timestamp.clone(),
                        event_id: event.event_id.clone(),
                    },
                );
            }
            EventPayload::WorkItemQueued(queued) => {
                let item = WorkItem {
                    work_item_id: queued.work_item_id,
                    worker: queued.worker,
                    attempt: queued.attempt,
                    status: WorkItemStatus::Queued,
                    inputs: queued.inputs,
                    outputs: Map::new(),
                    scope_key: queued.scope_key,
                    started_at: None,
                    finished_at: None,
                };
                // A re-queue (new attempt) resets the existing item in place
                match self.work_item_index(&item.work_item_id) {
                    Some(index) => self.work_items[index] = item,
                    None => self.work_items.push(item),
                }
            }
            EventPayload::WorkItemStarted(started) => {
                match self.work_item_index(&started.work_item_id) {
                    Some(index) => {
                        let item = &mut self.work_items[index];
                        item.status = WorkItemStatus::Running;
                        item.started_at = Some(event.timestamp.clone());
                        if let Some(attempt) = started.attempt {
                            item.attempt = attempt;
                        }
                    }
                    None => warn!(
                        work_item_id = %started.work_item_id,
                        event_id = %event.event_id,
                        "WORK_ITEM_STARTED for unknown work item"
                    ),
                }
            }
            EventPayload::WorkItemFinished(finished) => {
                match self.work_item_index(&finished.work_item_id) {
                    Some(index) => {
                        let item = &mut self.work_items[index];
                        item.status = WorkItemStatus::Finished;
                        item.finished_at = Some(event.timestamp.clone());
                        if let Some(outputs) = finished.outputs {
                            item.outputs = outputs;
                        }
                    }
                    None => warn!(
                        work_item_id = %finished.work_item_id,
                        event_id = %event.event_id,
                        "WORK_ITEM_FINISHED for unknown work item"
                    ),
                }
            }
            EventPayload::IssueOpened(opened) => {
                self.issues.push(opened.issue);
            }
            EventPayload::IssueResolved(resolved) => {
                match self
                    .issues
                    .iter_mut()
                    .find(|issue| issue.issue_id == resolved.issue_id)
                {
                    Some(issue) => {
                        issue.status = IssueStatus::Resolved;
                        issue.resolved_at = Some(event.timestamp.clone());
                    }
                    None => warn!(
                        issue_id = %resolved.issue_id,
                        event_id = %event.event_id,
                        "ISSUE_RESOLVED for unknown issue"
                    ),
                }
            }
            EventPayload::SectionStateChanged(change) => {
                self.section_states.insert(change.section, change.state);
            }
            EventPayload::Unknown { event_type, .. } => {
                debug!(%event_type, event_id = %event.event_id, "Skipping unrecognized event type");
            }
        }

        self.last_event_id = Some(event.event_id.clone());
        self.events_applied += 1;
        Ok(self)
    }

    /// Get a work item by id
    pub fn work_item(&self, work_item_id: &str) -> Option<&WorkItem> {
        self.work_items
            .iter()
            .find(|item| item.work_item_id == work_item_id)
    }

    /// Issues that have not been resolved
    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.status == IssueStatus::Open)
    }

    fn work_item_index(&self, work_item_id: &str) -> Option<usize> {
        self.work_items
            .iter()
            .position(|item| item.work_item_id == work_item_id)
    }
}
