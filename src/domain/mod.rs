//! Domain types for the substrate.
//!
//! This module contains the core data structures:
//! - Events: Immutable facts appended to a run's log
//! - Snapshot: The projection derived by replaying those facts

pub mod events;
pub mod snapshot;

// Re-export commonly used types
pub use events::{
    new_event_id, new_span_id, new_trace_id, now_timestamp, ArtifactWritten, Event, EventPayload,
    EventType, GateRunFinished, IssueOpened, IssueResolved, RunCreated, RunStateChanged,
    SectionStateChanged, WorkItemFinished, WorkItemQueued, WorkItemStarted,
};
pub use snapshot::{
    ApplyError, ArtifactIndexEntry, Issue, IssueStatus, RunState, Snapshot, WorkItem,
    WorkItemStatus, SCHEMA_VERSION,
};
