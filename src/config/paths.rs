//! On-disk layout under the stagehand home directory.
//!
//! | Location | Owner | Purpose |
//! |----------|-------|---------|
//! | `runs/<run_id>/events.jsonl` | run writer | Append-only event log |
//! | `runs/<run_id>/events.lock` | run writer | Single-writer lock |
//! | `runs/<run_id>/snapshot.json` | replay | Cached derived state |
//! | `telemetry_outbox.jsonl` | reporter | Undelivered telemetry |
//! | `offline_bundles/` | mutation client | Deferred commits and PRs |

use std::path::{Path, PathBuf};

pub const RUNS_DIR: &str = "runs";
pub const OUTBOX_FILE: &str = "telemetry_outbox.jsonl";
pub const BUNDLE_DIR: &str = "offline_bundles";

/// `<home>/runs`
pub fn runs_dir(home: &Path) -> PathBuf {
    home.join(RUNS_DIR)
}

/// `<home>/runs/<run_id>`
pub fn run_dir(home: &Path, run_id: &str) -> PathBuf {
    runs_dir(home).join(run_id)
}

/// `<home>/telemetry_outbox.jsonl`
pub fn outbox_path(home: &Path) -> PathBuf {
    home.join(OUTBOX_FILE)
}

/// `<home>/offline_bundles`
pub fn bundle_dir(home: &Path) -> PathBuf {
    home.join(BUNDLE_DIR)
}
