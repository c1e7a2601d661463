//! Event types for the event-sourced substrate.
//!
//! All run state changes are recorded as immutable events in an append-only log.
//! The wire form keeps the event `type` and its raw JSON `payload` so that
//! events written by other producers round-trip (and hash) byte-exactly.
//! [`EventPayload`] is the typed view the reducer works with.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::snapshot::{Issue, RunState};

/// A single event in the append-only event log.
///
/// Events are the source of truth for run state. The snapshot of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, creation-ordered identifier (UUIDv7)
    pub event_id: String,

    /// The run this event belongs to
    pub run_id: String,

    /// When this event occurred (ISO 8601 with zone), kept verbatim for hashing
    pub timestamp: String,

    /// Event type, e.g. `WORK_ITEM_STARTED`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Structured payload, interpreted according to `event_type`
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Correlation token shared by every event of a run
    pub trace_id: String,

    /// Correlation token for the unit of work that emitted this event
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Hash of the preceding event (hash chain)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,

    /// Hash of this event's contents and `prev_hash`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_hash: Option<String>,
}

impl Event {
    /// Create a new unhashed event with a fresh id and the current timestamp.
    pub fn new(
        run_id: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        payload: &EventPayload,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: new_event_id(),
            run_id: run_id.into(),
            timestamp: now_timestamp(),
            event_type: payload.event_type().to_string(),
            payload: payload.to_map()?,
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            prev_hash: None,
            event_hash: None,
        })
    }

    /// Attach a parent span
    pub fn with_parent_span(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Decode the typed payload for this event's type.
    pub fn decode_payload(&self) -> Result<EventPayload, serde_json::Error> {
        EventPayload::decode(&self.event_type, &self.payload)
    }

    /// Parsed timestamp, if it is valid RFC 3339
    pub fn occurred_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }

    /// Whether this event takes part in hash-chain validation
    pub fn is_hashed(&self) -> bool {
        self.event_hash.is_some()
    }
}

/// Event types understood by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunCreated,
    RunStateChanged,
    ArtifactWritten,
    WorkItemQueued,
    WorkItemStarted,
    WorkItemFinished,
    IssueOpened,
    IssueResolved,
    /// Reserved; gate results are recorded but do not change the snapshot
    GateRunFinished,
    SectionStateChanged,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::RunCreated,
        EventType::RunStateChanged,
        EventType::ArtifactWritten,
        EventType::WorkItemQueued,
        EventType::WorkItemStarted,
        EventType::WorkItemFinished,
        EventType::IssueOpened,
        EventType::IssueResolved,
        EventType::GateRunFinished,
        EventType::SectionStateChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunCreated => "RUN_CREATED",
            EventType::RunStateChanged => "RUN_STATE_CHANGED",
            EventType::ArtifactWritten => "ARTIFACT_WRITTEN",
            EventType::WorkItemQueued => "WORK_ITEM_QUEUED",
            EventType::WorkItemStarted => "WORK_ITEM_STARTED",
            EventType::WorkItemFinished => "WORK_ITEM_FINISHED",
            EventType::IssueOpened => "ISSUE_OPENED",
            EventType::IssueResolved => "ISSUE_RESOLVED",
            EventType::GateRunFinished => "GATE_RUN_FINISHED",
            EventType::SectionStateChanged => "SECTION_STATE_CHANGED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Typed event payloads, one variant per event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    RunCreated(RunCreated),
    RunStateChanged(RunStateChanged),
    ArtifactWritten(ArtifactWritten),
    WorkItemQueued(WorkItemQueued),
    WorkItemStarted(WorkItemStarted),
    WorkItemFinished(WorkItemFinished),
    IssueOpened(IssueOpened),
    IssueResolved(IssueResolved),
    GateRunFinished(GateRunFinished),
    SectionStateChanged(SectionStateChanged),
    /// A type this build does not know; replayed as a no-op
    Unknown {
        event_type: String,
        payload: Map<String, Value>,
    },
}

impl EventPayload {
    /// Decode a raw payload according to its event type.
    pub fn decode(event_type: &str, payload: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let Ok(known) = event_type.parse::<EventType>() else {
            return Ok(EventPayload::Unknown {
                event_type: event_type.to_string(),
                payload: payload.clone(),
            });
        };

        Ok(match known {
            EventType::RunCreated => EventPayload::RunCreated(from_map(payload)?),
            EventType::RunStateChanged => EventPayload::RunStateChanged(from_map(payload)?),
            EventType::ArtifactWritten => EventPayload::ArtifactWritten(from_map(payload)?),
            EventType::WorkItemQueued => EventPayload::WorkItemQueued(from_map(payload)?),
            EventType::WorkItemStarted => EventPayload::WorkItemStarted(from_map(payload)?),
            EventType::WorkItemFinished => EventPayload::WorkItemFinished(from_map(payload)?),
            EventType::IssueOpened => EventPayload::IssueOpened(from_map(payload)?),
            EventType::IssueResolved => EventPayload::IssueResolved(from_map(payload)?),
            EventType::GateRunFinished => EventPayload::GateRunFinished(from_map(payload)?),
            EventType::SectionStateChanged => {
                EventPayload::SectionStateChanged(from_map(payload)?)
            }
        })
    }

    /// The wire name of this payload's event type
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::RunCreated(_) => EventType::RunCreated.as_str(),
            EventPayload::RunStateChanged(_) => EventType::RunStateChanged.as_str(),
            EventPayload::ArtifactWritten(_) => EventType::ArtifactWritten.as_str(),
            EventPayload::WorkItemQueued(_) => EventType::WorkItemQueued.as_str(),
            EventPayload::WorkItemStarted(_) => EventType::WorkItemStarted.as_str(),
            EventPayload::WorkItemFinished(_) => EventType::WorkItemFinished.as_str(),
            EventPayload::IssueOpened(_) => EventType::IssueOpened.as_str(),
            EventPayload::IssueResolved(_) => EventType::IssueResolved.as_str(),
            EventPayload::GateRunFinished(_) => EventType::GateRunFinished.as_str(),
            EventPayload::SectionStateChanged(_) => EventType::SectionStateChanged.as_str(),
            EventPayload::Unknown { event_type, .. } => event_type,
        }
    }

    /// Encode the payload as the JSON object stored in the log.
    pub fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match self {
            EventPayload::RunCreated(p) => to_map(p),
            EventPayload::RunStateChanged(p) => to_map(p),
            EventPayload::ArtifactWritten(p) => to_map(p),
            EventPayload::WorkItemQueued(p) => to_map(p),
            EventPayload::WorkItemStarted(p) => to_map(p),
            EventPayload::WorkItemFinished(p) => to_map(p),
            EventPayload::IssueOpened(p) => to_map(p),
            EventPayload::IssueResolved(p) => to_map(p),
            EventPayload::GateRunFinished(p) => to_map(p),
            EventPayload::SectionStateChanged(p) => to_map(p),
            EventPayload::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }
}

fn from_map<T: DeserializeOwned>(payload: &Map<String, Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(payload.clone()))
}

fn to_map<T: Serialize>(payload: &T) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(serde::ser::Error::custom("event payload must be a JSON object")),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCreated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Free-form run metadata (repository, requester, ...)
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateChanged {
    pub new_state: RunState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<RunState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactWritten {
    pub name: String,
    pub path: String,
    pub sha256: String,
    #[serde(default)]
    pub schema_id: String,
    #[serde(default)]
    pub writer_worker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemQueued {
    pub work_item_id: String,
    pub worker: String,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemStarted {
    pub work_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemFinished {
    pub work_item_id: String,
    /// Replaces the work item's outputs when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueOpened {
    pub issue: Issue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueResolved {
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateRunFinished {
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionStateChanged {
    pub section: String,
    pub state: String,
}

/// New event id: UUIDv7, so ids sort by creation time.
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// New trace id: 32 random hex characters.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// New span id: 16 random hex characters.
pub fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Current time as RFC 3339 with microseconds and an explicit offset.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued(id: &str) -> EventPayload {
        EventPayload::WorkItemQueued(WorkItemQueued {
            work_item_id: id.to_string(),
            worker: "scout".to_string(),
            attempt: 1,
            inputs: Map::new(),
            scope_key: None,
        })
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new("run-1", new_trace_id(), new_span_id(), &queued("w1")).unwrap();

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "WORK_ITEM_QUEUED");
        assert_eq!(json["payload"]["work_item_id"], "w1");
        assert!(json.get("prev_hash").is_none());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_payload_decode_known_type() {
        let event = Event::new("run-1", "t", "s", &queued("w1")).unwrap();
        assert_eq!(event.decode_payload().unwrap(), queued("w1"));
    }

    #[test]
    fn test_payload_decode_unknown_type() {
        let payload = json!({"anything": 1}).as_object().cloned().unwrap();
        let decoded = EventPayload::decode("LLM_CALL_FINISHED", &payload).unwrap();

        assert!(matches!(decoded, EventPayload::Unknown { ref event_type, .. } if event_type == "LLM_CALL_FINISHED"));
        assert_eq!(decoded.event_type(), "LLM_CALL_FINISHED");
    }

    #[test]
    fn test_payload_decode_rejects_malformed_known_type() {
        let payload = json!({"worker": "scout"}).as_object().cloned().unwrap();
        assert!(EventPayload::decode("WORK_ITEM_QUEUED", &payload).is_err());
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
    }

    #[test]
    fn test_event_ids_sort_by_creation() {
        let ids: Vec<String> = (0..50).map(|_| new_event_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_correlation_id_shapes() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_span_id().len(), 16);
        assert_ne!(new_span_id(), new_span_id());
    }

    #[test]
    fn test_timestamp_has_zone() {
        let event = Event::new("run-1", "t", "s", &queued("w1")).unwrap();
        assert!(event.timestamp.ends_with("+00:00"));
        assert!(event.occurred_at().is_some());
    }
}
