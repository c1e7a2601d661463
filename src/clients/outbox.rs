//! Durable telemetry outbox.
//!
//! Undelivered telemetry records are kept as JSON lines
//! `{endpoint, method, payload, timestamp}` and re-sent on flush. The file
//! is rewritten wholesale (atomically) on every change and is bounded by a
//! byte ceiling: past it the oldest half of the entries are discarded.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::core::atomic::{atomic_write, remove_if_exists};
use crate::core::canonical::to_canonical_string;

/// Errors that can occur with the outbox file
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A buffered request waiting for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Path relative to the collector base URL
    pub endpoint: String,

    /// HTTP method name
    pub method: String,

    /// Canonical request body (includes the idempotency key)
    pub payload: Value,

    /// When the entry was buffered
    pub timestamp: String,
}

/// Entries read from disk
#[derive(Debug, Clone, Default)]
pub struct OutboxContents {
    pub entries: Vec<OutboxEntry>,

    /// Lines that could not be parsed and were dropped
    pub discarded: usize,
}

/// File-backed outbox with a size ceiling
#[derive(Debug, Clone)]
pub struct Outbox {
    path: PathBuf,
    max_bytes: u64,
}

impl Outbox {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Load buffered entries in order. Unparsable lines (including ones that
    /// are not UTF-8) are dropped with a warning; they can never be delivered.
    pub async fn load(&self) -> Result<OutboxContents, OutboxError> {
        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(OutboxContents::default()),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = OutboxContents::default();
        for (index, line) in contents.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<OutboxEntry>(line) {
                Ok(entry) => loaded.entries.push(entry),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %err,
                        "Discarding unparsable outbox line"
                    );
                    loaded.discarded += 1;
                }
            }
        }

        Ok(loaded)
    }

    /// Append an entry, discarding the oldest entries first if the file
    /// would grow past the ceiling. The new entry is always kept.
    pub async fn push(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let existing = self.load().await?;
        let mut lines = existing
            .entries
            .iter()
            .map(encode_line)
            .collect::<Result<Vec<_>, _>>()?;
        let new_line = encode_line(entry)?;

        if total_len(&lines) + new_line.len() as u64 > self.max_bytes {
            let mut dropped = (lines.len() + 1) / 2;
            lines.drain(..dropped);
            while !lines.is_empty() && total_len(&lines) + new_line.len() as u64 > self.max_bytes {
                lines.remove(0);
                dropped += 1;
            }
            warn!(
                path = %self.path.display(),
                dropped,
                kept = lines.len(),
                max_bytes = self.max_bytes,
                "Outbox over size ceiling; discarded oldest entries"
            );
        }

        lines.push(new_line);
        atomic_write(&self.path, lines.concat().into_bytes()).await?;
        Ok(())
    }

    /// Replace the outbox with `entries`, removing the file when empty
    pub async fn replace(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError> {
        if entries.is_empty() {
            remove_if_exists(&self.path).await?;
            return Ok(());
        }

        let lines = entries
            .iter()
            .map(encode_line)
            .collect::<Result<Vec<_>, _>>()?;
        atomic_write(&self.path, lines.concat().into_bytes()).await?;
        Ok(())
    }
}

fn encode_line(entry: &OutboxEntry) -> Result<String, serde_json::Error> {
    let mut line = to_canonical_string(entry)?;
    line.push('\n');
    Ok(line)
}

fn total_len(lines: &[String]) -> u64 {
    lines.iter().map(|l| l.len() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(n: usize) -> OutboxEntry {
        OutboxEntry {
            endpoint: "/api/v1/runs".to_string(),
            method: "POST".to_string(),
            payload: json!({"idempotency_key": format!("key-{:04}", n)}),
            timestamp: "2026-01-01T00:00:00.000000+00:00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_and_load_preserve_order() {
        let temp = TempDir::new().unwrap();
        let outbox = Outbox::new(temp.path().join("outbox.jsonl"), 1_000_000);

        for n in 0..3 {
            outbox.push(&entry(n)).await.unwrap();
        }

        let loaded = outbox.load().await.unwrap();
        assert_eq!(loaded.entries, vec![entry(0), entry(1), entry(2)]);
        assert_eq!(loaded.discarded, 0);
    }

    #[tokio::test]
    async fn test_ceiling_drops_oldest_half() {
        let temp = TempDir::new().unwrap();
        let line_len = encode_line(&entry(0)).unwrap().len() as u64;
        let outbox = Outbox::new(temp.path().join("outbox.jsonl"), line_len * 4);

        for n in 0..4 {
            outbox.push(&entry(n)).await.unwrap();
        }
        outbox.push(&entry(4)).await.unwrap();

        let loaded = outbox.load().await.unwrap();
        assert_eq!(loaded.entries, vec![entry(2), entry(3), entry(4)]);

        let size = std::fs::metadata(outbox.path()).unwrap().len();
        assert!(size <= outbox.max_bytes());
    }

    #[tokio::test]
    async fn test_replace_with_nothing_removes_file() {
        let temp = TempDir::new().unwrap();
        let outbox = Outbox::new(temp.path().join("outbox.jsonl"), 1_000_000);

        outbox.push(&entry(0)).await.unwrap();
        outbox.replace(&[]).await.unwrap();

        assert!(!outbox.path().exists());
        assert!(outbox.load().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_load_discards_non_utf8_lines() {
        let temp = TempDir::new().unwrap();
        let outbox = Outbox::new(temp.path().join("outbox.jsonl"), 1_000_000);

        let mut contents = encode_line(&entry(0)).unwrap().into_bytes();
        contents.extend_from_slice(b"\xff\xfe not json\r\n");
        contents.extend_from_slice(encode_line(&entry(1)).unwrap().as_bytes());
        std::fs::write(outbox.path(), contents).unwrap();

        let loaded = outbox.load().await.unwrap();
        assert_eq!(loaded.entries, vec![entry(0), entry(1)]);
        assert_eq!(loaded.discarded, 1);

        // The bad line is gone once the file is rewritten
        outbox.push(&entry(2)).await.unwrap();
        let reloaded = outbox.load().await.unwrap();
        assert_eq!(reloaded.entries, vec![entry(0), entry(1), entry(2)]);
        assert_eq!(reloaded.discarded, 0);
    }
}
