//! stagehand - reliability substrate for a multi-stage generation pipeline
//!
//! Worker stages run as separate invocations; stagehand gives them durable,
//! replayable run state and safe outbound side effects.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every state change is an immutable event appended to a per-run JSONL log
//! - Events are hash-chained so tampering and deletion are detectable
//! - Current state (the snapshot) is derived by replaying events, and cached
//! - Outbound side effects carry idempotency keys so retries are safe
//!
//! # Modules
//!
//! - `domain`: Data structures (Event, EventPayload, Snapshot)
//! - `core`: EventLog, replay, RunContext, atomic writes
//! - `clients`: TelemetryReporter (outbox-buffered) and MutationClient (idempotent)
//! - `config`: Config file discovery and environment overrides
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Rebuild and inspect a run
//! stagehand status ~/.stagehand/runs/<run-id>
//!
//! # Check the hash chain
//! stagehand verify ~/.stagehand/runs/<run-id>
//!
//! # Deliver buffered telemetry
//! stagehand outbox flush
//! ```

pub mod cli;
pub mod clients;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use clients::{MutationClient, MutationError, ReportOutcome, TelemetryReporter};
pub use core::{EventLog, RunContext};
pub use domain::{Event, EventPayload, EventType, RunState, Snapshot};
