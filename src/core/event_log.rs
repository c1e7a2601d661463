//! Append-only event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one canonical
//! (sorted-key) object per line. When hash chaining is enabled each appended
//! event carries the hash of its predecessor, so retroactive edits or
//! deletions are detectable with [`validate_chain`].
//!
//! A run directory has exactly one writer: [`EventLog::open`] takes an
//! exclusive lock on `events.lock` and fails fast if another process holds it.
//! Readers ([`read_events`]) take no lock.

use std::fs::File as StdFile;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::canonical::{canonical_json, canonical_object};
use crate::domain::Event;

/// Name of the event log inside a run directory
pub const EVENTS_FILE: &str = "events.jsonl";

/// Name of the single-writer lock file inside a run directory
pub const LOCK_FILE: &str = "events.lock";

/// Errors that can occur reading or writing the event log
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt event at {}:{line}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event log is locked by another writer: {}", path.display())]
    Locked { path: PathBuf },
}

/// Hash chain violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("event {event_id} (position {index}) records hash {recorded} but hashes to {computed}")]
    HashMismatch {
        index: usize,
        event_id: String,
        recorded: String,
        computed: String,
    },

    #[error("event {event_id} (position {index}) links to {found} but the preceding hash is {expected:?}")]
    BrokenLink {
        index: usize,
        event_id: String,
        expected: Option<String>,
        found: String,
    },
}

/// Writer handle for one run's event log
#[derive(Debug)]
pub struct EventLog {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Whether appends are hash-chained
    hash_chain: bool,

    /// `event_hash` of the last appended event
    last_hash: Option<String>,

    /// Set when a failed append could not be rolled back
    needs_repair: bool,

    /// Held for the lifetime of the writer
    _lock: StdFile,
}

impl EventLog {
    /// Open (creating if needed) the event log in `run_dir` for writing.
    ///
    /// Repairs a torn final line left by a crash and recovers the chain
    /// cursor from the last event on disk.
    pub async fn open(run_dir: impl Into<PathBuf>, hash_chain: bool) -> Result<Self, EventLogError> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir).await?;

        let lock = acquire_lock(&run_dir.join(LOCK_FILE))?;
        let events_path = run_dir.join(EVENTS_FILE);

        repair_torn_tail(&events_path).await?;
        let last_hash = read_events(&events_path)
            .await?
            .last()
            .and_then(|event| event.event_hash.clone());

        debug!(path = %events_path.display(), hash_chain, "Opened event log");

        Ok(Self {
            run_dir,
            events_path,
            hash_chain,
            last_hash,
            needs_repair: false,
            _lock: lock,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Hash of the most recently appended event, if it was hashed
    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Append an event to the log.
    ///
    /// With hash chaining enabled, `prev_hash` and `event_hash` are filled in
    /// before writing. Returns the event exactly as written. A failed write is
    /// truncated away so the log never gains a torn interior line.
    pub async fn append(&mut self, mut event: Event) -> Result<Event, EventLogError> {
        if self.needs_repair {
            self.recover().await?;
        }

        if self.hash_chain {
            event.prev_hash = self.last_hash.clone();
            event.event_hash = Some(compute_event_hash(&event));
        }

        let line = encode_line(&event)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await?;
        let start = file.metadata().await?.len();

        if let Err(err) = write_line(&mut file, line.as_bytes()).await {
            self.roll_back(&file, start).await;
            return Err(err.into());
        }

        self.last_hash = event.event_hash.clone();
        Ok(event)
    }

    /// Cut the file back to `len` after a failed append. If that fails too,
    /// the next append repairs the tail first.
    async fn roll_back(&mut self, file: &fs::File, len: u64) {
        let truncated = async {
            file.set_len(len).await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = truncated {
            warn!(
                path = %self.events_path.display(),
                error = %err,
                "Could not roll back failed append; will repair before next write"
            );
            self.needs_repair = true;
        }
    }

    async fn recover(&mut self) -> Result<(), EventLogError> {
        repair_torn_tail(&self.events_path).await?;
        self.last_hash = read_events(&self.events_path)
            .await?
            .last()
            .and_then(|event| event.event_hash.clone());
        self.needs_repair = false;
        Ok(())
    }

    /// Read all events in append order
    pub async fn read_all(&self) -> Result<Vec<Event>, EventLogError> {
        read_events(&self.events_path).await
    }
}

/// Read every event from a log file; an absent file is an empty log.
///
/// A final line without its trailing newline that fails to parse is a torn
/// write and is skipped with a warning. Any other unparsable line is an error.
pub async fn read_events(path: &Path) -> Result<Vec<Event>, EventLogError> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    parse_events(path, &contents)
}

fn parse_events(path: &Path, contents: &[u8]) -> Result<Vec<Event>, EventLogError> {
    let complete = contents.ends_with(b"\n");
    let lines: Vec<&[u8]> = contents.split(|b| *b == b'\n').collect();
    let last_index = lines.len() - 1;
    let mut events = Vec::with_capacity(lines.len());

    for (index, line) in lines.into_iter().enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<Event>(line) {
            Ok(event) => events.push(event),
            Err(source) if index == last_index && !complete => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %source,
                    "Ignoring torn final line in event log"
                );
            }
            Err(source) => {
                return Err(EventLogError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source,
                })
            }
        }
    }

    Ok(events)
}

/// Compute an event's chain hash:
/// `SHA256(event_id ∥ timestamp ∥ type ∥ canonical_json(payload) ∥ prev_hash_or_empty)`
pub fn compute_event_hash(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.as_bytes());
    hasher.update(event.timestamp.as_bytes());
    hasher.update(event.event_type.as_bytes());
    hasher.update(canonical_object(&event.payload).as_bytes());
    hasher.update(event.prev_hash.as_deref().unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify the hash chain over an ordered sequence of events.
///
/// Every event carrying `event_hash` must hash to it, and every event carrying
/// `prev_hash` must directly follow an event whose `event_hash` matches.
/// Events carrying neither are not checked.
pub fn validate_chain(events: &[Event]) -> Result<(), ChainError> {
    let mut previous: Option<&Event> = None;

    for (index, event) in events.iter().enumerate() {
        if let Some(recorded) = &event.event_hash {
            let computed = compute_event_hash(event);
            if *recorded != computed {
                return Err(ChainError::HashMismatch {
                    index,
                    event_id: event.event_id.clone(),
                    recorded: recorded.clone(),
                    computed,
                });
            }
        }

        if let Some(found) = event.prev_hash.as_deref().filter(|h| !h.is_empty()) {
            let expected = previous.and_then(|p| p.event_hash.clone());
            if expected.as_deref() != Some(found) {
                return Err(ChainError::BrokenLink {
                    index,
                    event_id: event.event_id.clone(),
                    expected,
                    found: found.to_string(),
                });
            }
        }

        previous = Some(event);
    }

    Ok(())
}

/// Serialize an event as one canonical JSONL line
pub fn encode_line(event: &Event) -> Result<String, serde_json::Error> {
    let mut line = canonical_json(&serde_json::to_value(event)?);
    line.push('\n');
    Ok(line)
}

fn acquire_lock(lock_path: &Path) -> Result<StdFile, EventLogError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(EventLogError::Locked {
            path: lock_path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn write_line(file: &mut fs::File, line: &[u8]) -> io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

/// Deal with a final line that lost its newline in a crash: complete it if it
/// parses, otherwise cut it off.
async fn repair_torn_tail(path: &Path) -> Result<(), EventLogError> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }

    let tail_start = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let tail = &contents[tail_start..];

    if serde_json::from_slice::<Event>(tail).is_ok() {
        warn!(path = %path.display(), "Completing final event line missing its newline");
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(b"\n").await?;
        file.sync_data().await?;
    } else {
        warn!(
            path = %path.display(),
            bytes = tail.len(),
            "Truncating torn final line of event log"
        );
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(tail_start as u64).await?;
        file.sync_all().await?;
    }

    Ok(())
}
