//! # Append-only per-run event log.
//!
//! Storage format: newline-delimited JSON, one [`Envelope`] per line, in
//! sequence order.
//! ```text
//! {"type":"run.queued",...,"sequence":1,...}\n
//! {"type":"run.started",...,"sequence":2,...}\n
//! ```
//!
//! ## Rules
//! - Strict append only: no mutation, no deletion, no reordering.
//! - One writer per file (the run's dispatcher channel); any number of readers.
//! - Appends are flushed (and `fsync`ed when configured) before they are acknowledged.
//! - Reads are forward sequential scans.
//! - A torn final line (crash mid-write) is skipped with a warning; a bad line
//!   anywhere else is [`LogError::Corrupt`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, Lines};

use crate::error::LogError;
use crate::schema::Envelope;

/// Writer half of a run's event log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
    last_sequence: u64,
    sync: bool,
}

impl EventLog {
    /// Opens or creates the log at `path`.
    ///
    /// Existing content is scanned to recover the last persisted sequence.
    pub async fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let last_sequence = last_sequence(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;
        terminate_torn_line(&mut file).await?;

        Ok(Self {
            path,
            file,
            last_sequence,
            sync,
        })
    }

    /// Appends one envelope as a single line.
    pub async fn append(&mut self, envelope: &Envelope) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        self.file.write_all(&line).await?;
        self.file.flush().await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        self.last_sequence = envelope.sequence;
        Ok(())
    }

    /// Highest sequence persisted in this file.
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes a newline if the file ends mid-line, so the next append starts clean.
async fn terminate_torn_line(file: &mut File) -> Result<(), LogError> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] != b'\n' {
        file.write_all(b"\n").await?;
        file.flush().await?;
    }
    Ok(())
}

/// Forward scanner over a run's event log.
pub struct EventLogReader {
    lines: Option<Lines<BufReader<File>>>,
    line_no: u64,
}

impl EventLogReader {
    /// Opens a reader. A missing file reads as an empty log.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let lines = match File::open(path.as_ref()).await {
            Ok(f) => Some(BufReader::new(f).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { lines, line_no: 0 })
    }

    /// Next envelope in file order, `None` at end of file.
    pub async fn next(&mut self) -> Result<Option<Envelope>, LogError> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        loop {
            let Some(line) = lines.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Envelope>(&line) {
                Ok(env) => return Ok(Some(env)),
                Err(e) => {
                    let bad_line = self.line_no;
                    // Only a torn tail is tolerated: look for any content after it.
                    while let Some(rest) = lines.next_line().await? {
                        self.line_no += 1;
                        if !rest.trim().is_empty() {
                            return Err(LogError::Corrupt {
                                line: bad_line,
                                reason: e.to_string(),
                            });
                        }
                    }
                    tracing::warn!(line = bad_line, error = %e, "skipping torn final event log line");
                    return Ok(None);
                }
            }
        }
    }
}

/// Reads a whole log into memory.
pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<Envelope>, LogError> {
    let mut reader = EventLogReader::open(path).await?;
    let mut out = Vec::new();
    while let Some(env) = reader.next().await? {
        out.push(env);
    }
    Ok(out)
}

/// Highest sequence in a log (0 when missing or empty).
pub async fn last_sequence(path: impl AsRef<Path>) -> Result<u64, LogError> {
    let mut reader = EventLogReader::open(path).await?;
    let mut last = 0;
    while let Some(env) = reader.next().await? {
        last = last.max(env.sequence);
    }
    Ok(last)
}

/// One page of persisted events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Envelope>,
    /// Cursor for the next page: the last returned sequence, or the request cursor.
    pub next_after_sequence: u64,
    pub has_more: bool,
}

/// Reads up to `limit` events with `sequence > after_sequence`.
pub async fn read_page(
    path: impl AsRef<Path>,
    after_sequence: u64,
    limit: usize,
) -> Result<EventPage, LogError> {
    let limit = limit.max(1);
    let mut reader = EventLogReader::open(path).await?;
    let mut events = Vec::with_capacity(limit.min(256));
    let mut has_more = false;

    while let Some(env) = reader.next().await? {
        if env.sequence <= after_sequence {
            continue;
        }
        if events.len() == limit {
            has_more = true;
            break;
        }
        events.push(env);
    }

    let next_after_sequence = events.last().map_or(after_sequence, |e| e.sequence);
    Ok(EventPage {
        events,
        next_after_sequence,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RunId;
    use crate::schema::EventSource;
    use chrono::Utc;

    fn env(seq: u64) -> Envelope {
        Envelope {
            event_type: "run.warning".into(),
            schema_version: 1,
            event_id: crate::ids::new_event_id(),
            created_at: Utc::now(),
            sequence: seq,
            source: EventSource::Orchestrator,
            run_id: RunId::from("r"),
            build_id: None,
            payload: serde_json::json!({"code": "c", "message": "m"}),
        }
    }

    #[tokio::test]
    async fn append_then_scan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/r/events.ndjson");
        let mut log = EventLog::open(&path, false).await.unwrap();
        for s in 1..=5 {
            log.append(&env(s)).await.unwrap();
        }
        let all = read_all(&path).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn reopen_recovers_last_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        {
            let mut log = EventLog::open(&path, true).await.unwrap();
            log.append(&env(1)).await.unwrap();
            log.append(&env(2)).await.unwrap();
        }
        let log = EventLog::open(&path, true).await.unwrap();
        assert_eq!(log.last_sequence(), 2);
    }

    #[tokio::test]
    async fn torn_tail_is_skipped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        {
            let mut log = EventLog::open(&path, false).await.unwrap();
            log.append(&env(1)).await.unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).await.unwrap();
        f.write_all(br#"{"type":"run.warn"#).await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        assert_eq!(read_all(&path).await.unwrap().len(), 1);

        // Reopening terminates the torn line; later appends stay readable
        // but the torn line is now in the middle of the file.
        let mut log = EventLog::open(&path, false).await.unwrap();
        assert_eq!(log.last_sequence(), 1);
        log.append(&env(2)).await.unwrap();
        let err = read_all(&path).await.unwrap_err();
        assert_eq!(err.as_label(), "log_corrupt");
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let page = read_page(dir.path().join("nope"), 0, 10).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_after_sequence, 0);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn pages_walk_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut log = EventLog::open(&path, false).await.unwrap();
        for s in 1..=5 {
            log.append(&env(s)).await.unwrap();
        }

        let p1 = read_page(&path, 0, 2).await.unwrap();
        assert_eq!(p1.events.len(), 2);
        assert!(p1.has_more);
        assert_eq!(p1.next_after_sequence, 2);

        let p2 = read_page(&path, p1.next_after_sequence, 2).await.unwrap();
        assert_eq!(p2.events[0].sequence, 3);

        let p3 = read_page(&path, 4, 2).await.unwrap();
        assert_eq!(p3.events.len(), 1);
        assert!(!p3.has_more);
        assert_eq!(p3.next_after_sequence, 5);
    }
}
