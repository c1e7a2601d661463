//! Deterministic replay and snapshot persistence.
//!
//! The event log is the only source of truth. A snapshot is rebuilt by
//! folding every event, in file order, into [`Snapshot::initial`]; the
//! snapshot file is a cache that can always be thrown away and rebuilt.
//!
//! # File Format
//!
//! `snapshot.json` is pretty-printed JSON with a fixed key order and an
//! explicit `schema_version`. It is written atomically.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::atomic::atomic_write;
use super::event_log::{read_events, validate_chain, ChainError, EventLogError, EVENTS_FILE};
use crate::domain::{ApplyError, Event, Snapshot, SCHEMA_VERSION};

/// Name of the cached snapshot inside a run directory
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Errors that can occur during replay or snapshot persistence
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Log(#[from] EventLogError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Event log integrity check failed: {0}")]
    Integrity(#[from] ChainError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u64 },
}

/// Result of a strict integrity audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// Number of events in the log
    pub events: usize,

    /// Number of events taking part in the hash chain
    pub hashed_events: usize,

    /// Hash of the last hashed event
    pub last_hash: Option<String>,
}

/// Fresh snapshot for a run
pub fn create_initial(run_id: &str) -> Snapshot {
    Snapshot::initial(run_id)
}

/// Fold one event into a snapshot
pub fn apply(snapshot: Snapshot, event: &Event) -> Result<Snapshot, ApplyError> {
    snapshot.apply(event)
}

/// Fold events in order, starting from an empty snapshot
pub fn fold_events(run_id: &str, events: &[Event]) -> Result<Snapshot, ApplyError> {
    events
        .iter()
        .try_fold(create_initial(run_id), |snapshot, event| snapshot.apply(event))
}

/// Validate the chain (warning on a break) and fold the events.
///
/// A broken chain does not stop replay: the rest of the history is still usable.
pub fn replay_events(run_id: &str, events: &[Event]) -> Result<Snapshot, ApplyError> {
    if let Err(err) = validate_chain(events) {
        warn!(%run_id, error = %err, "Event log integrity check failed; continuing replay");
    }
    fold_events(run_id, events)
}

/// Rebuild a run's snapshot from its event log
#[instrument(skip(log_path), fields(log = %log_path.display()))]
pub async fn replay(log_path: &Path, run_id: &str) -> Result<Snapshot, ReplayError> {
    let events = read_events(log_path).await?;
    let snapshot = replay_events(run_id, &events)?;
    debug!(events = events.len(), "Replayed event log");
    Ok(snapshot)
}

/// Strict integrity audit: any chain break is an error
pub async fn audit(log_path: &Path) -> Result<AuditReport, ReplayError> {
    let events = read_events(log_path).await?;
    validate_chain(&events)?;

    Ok(AuditReport {
        events: events.len(),
        hashed_events: events.iter().filter(|e| e.is_hashed()).count(),
        last_hash: events.iter().rev().find_map(|e| e.event_hash.clone()),
    })
}

/// Atomically write a snapshot
pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), ReplayError> {
    let mut contents = serde_json::to_vec_pretty(snapshot)?;
    contents.push(b'\n');
    atomic_write(path, contents).await?;
    Ok(())
}

/// Read a snapshot, rejecting other schema versions
pub async fn read_snapshot(path: &Path) -> Result<Snapshot, ReplayError> {
    let contents = tokio::fs::read(path).await?;
    let value: serde_json::Value = serde_json::from_slice(&contents)?;

    let got = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if got != u64::from(SCHEMA_VERSION) {
        return Err(ReplayError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got,
        });
    }

    Ok(serde_json::from_value(value)?)
}

/// Crash recovery: use the cached snapshot if it is current, otherwise
/// replay the full log and refresh the cache.
///
/// The chain is checked on every call. A log that fails the check is never
/// answered from the cache, since the cache may predate the damage.
#[instrument(skip(run_dir), fields(run_dir = %run_dir.display()))]
pub async fn load_or_replay(run_dir: &Path, run_id: &str) -> Result<Snapshot, ReplayError> {
    let snapshot_path = run_dir.join(SNAPSHOT_FILE);
    let events = read_events(&run_dir.join(EVENTS_FILE)).await?;
    let last_event_id = events.last().map(|e| e.event_id.clone());

    let chain_ok = match validate_chain(&events) {
        Ok(()) => true,
        Err(err) => {
            warn!(%run_id, error = %err, "Event log integrity check failed; continuing replay");
            false
        }
    };

    match read_snapshot(&snapshot_path).await {
        Ok(cached)
            if chain_ok && cached.run_id == run_id && cached.last_event_id == last_event_id =>
        {
            debug!("Using cached snapshot");
            return Ok(cached);
        }
        Ok(_) if !chain_ok => info!("Chain broken; not trusting cached snapshot"),
        Ok(_) => info!("Cached snapshot is stale; replaying"),
        Err(ReplayError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No cached snapshot; replaying")
        }
        Err(err) => warn!(error = %err, "Cached snapshot unusable; replaying"),
    }

    let snapshot = fold_events(run_id, &events)?;
    write_snapshot(&snapshot_path, &snapshot).await?;
    Ok(snapshot)
}
