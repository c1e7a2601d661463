//! Core substrate logic.
//!
//! This module contains:
//! - EventLog: Append-only, hash-chained event logging
//! - Replay: Snapshot reconstruction and persistence
//! - RunContext: Per-run handle for worker stages
//! - Canonical JSON and atomic file writes shared by every writer

pub mod atomic;
pub mod canonical;
pub mod context;
pub mod event_log;
pub mod replay;

// Re-export commonly used types
pub use atomic::atomic_write;
pub use canonical::{canonical_json, to_canonical_string};
pub use context::RunContext;
pub use event_log::{
    compute_event_hash, read_events, validate_chain, ChainError, EventLog, EventLogError,
    EVENTS_FILE, LOCK_FILE,
};
pub use replay::{
    audit, create_initial, fold_events, load_or_replay, read_snapshot, replay, write_snapshot,
    AuditReport, ReplayError, SNAPSHOT_FILE,
};
