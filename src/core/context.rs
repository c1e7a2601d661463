//! Per-run handle handed to worker stages.
//!
//! Bundles the run's event log writer with its trace id so stages emit
//! correlated events without reaching for any global state.

use std::path::{Path, PathBuf};

use tracing::info;

use super::event_log::{EventLog, EventLogError};
use super::replay::{load_or_replay, ReplayError};
use crate::domain::{new_span_id, new_trace_id, Event, EventPayload, Snapshot};

/// Writer-side context for one run
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    trace_id: String,
    log: EventLog,
}

impl RunContext {
    /// Open the run directory `<runs_dir>/<run_id>` for writing.
    ///
    /// An existing run keeps the trace id of its first event.
    pub async fn open(runs_dir: &Path, run_id: &str, hash_chain: bool) -> Result<Self, EventLogError> {
        let log = EventLog::open(runs_dir.join(run_id), hash_chain).await?;
        let trace_id = log
            .read_all()
            .await?
            .first()
            .map(|event| event.trace_id.clone())
            .unwrap_or_else(new_trace_id);

        info!(%run_id, %trace_id, "Opened run");

        Ok(Self {
            run_id: run_id.to_string(),
            trace_id,
            log,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.log.run_dir().to_path_buf()
    }

    /// Append an event in a new root span
    pub async fn emit(&mut self, payload: EventPayload) -> Result<Event, EventLogError> {
        let event = Event::new(&self.run_id, &self.trace_id, new_span_id(), &payload)?;
        self.log.append(event).await
    }

    /// Append an event in a new span nested under `parent_span_id`
    pub async fn emit_child(
        &mut self,
        parent_span_id: &str,
        payload: EventPayload,
    ) -> Result<Event, EventLogError> {
        let event = Event::new(&self.run_id, &self.trace_id, new_span_id(), &payload)?
            .with_parent_span(parent_span_id);
        self.log.append(event).await
    }

    /// Current snapshot, from cache when it is up to date
    pub async fn snapshot(&self) -> Result<Snapshot, ReplayError> {
        load_or_replay(self.log.run_dir(), &self.run_id).await
    }
}
