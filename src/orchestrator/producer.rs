//! # Producer boundary: engine facts and output lines.
//!
//! Subprocess output mixes structured facts and free text. Every line is
//! classified exactly once, here, into a [`ProducerLine`]:
//!
//! ```text
//! line starts with '{' ──► parse EngineFact ──► Fact(fact)
//!                                 └─ error ──► MalformedLine (dropped, run.warning)
//! anything else        ──────────────────────► Text(line)
//! ```
//!
//! [`ProducerOutput`] is the sending half handed to engines and build steps.
//! In-process engines send typed facts directly; subprocess adapters send raw
//! lines and let the output classify them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::orchestrator::ConsoleStream;
use crate::report::TableFacts;

/// Structured fact reported by the extraction engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case", deny_unknown_fields)]
pub enum EngineFact {
    PhaseStarted {
        phase: String,
    },
    PhaseCompleted {
        phase: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    FieldsDeclared {
        fields: Vec<String>,
    },
    TableCompleted {
        table: TableFacts,
    },
    SheetCompleted {
        workbook: String,
        sheet: String,
        #[serde(default)]
        sheet_index: u32,
    },
    WorkbookCompleted {
        workbook: String,
    },
    /// Terminal self-report. Absent `failure` means the engine succeeded.
    Finished {
        #[serde(default)]
        failure: Option<EngineFailure>,
        #[serde(default)]
        normalized_path: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineFailure {
    pub code: String,
    pub message: String,
}

/// A classified output line.
#[derive(Clone, Debug, PartialEq)]
pub enum ProducerLine {
    Fact(Box<EngineFact>),
    Text(String),
}

/// A line that looked structured but could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedLine {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 200;
        let shown: String = self.line.chars().take(MAX).collect();
        write!(f, "{} (line: {shown})", self.reason)
    }
}

/// Classifies one raw output line.
pub fn classify_line(line: &str) -> Result<ProducerLine, MalformedLine> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if !trimmed.trim_start().starts_with('{') {
        return Ok(ProducerLine::Text(trimmed.to_owned()));
    }
    serde_json::from_str::<EngineFact>(trimmed)
        .map(|f| ProducerLine::Fact(Box::new(f)))
        .map_err(|e| MalformedLine {
            line: trimmed.to_owned(),
            reason: e.to_string(),
        })
}

/// One item on the producer channel.
#[derive(Debug)]
pub struct OutputItem {
    pub stream: ConsoleStream,
    pub line: Result<ProducerLine, MalformedLine>,
}

/// Sending half of a producer channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ProducerOutput {
    tx: mpsc::Sender<OutputItem>,
}

impl ProducerOutput {
    /// Creates a bounded producer channel (capacity at least 1).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Sends a typed fact. Returns `false` once the orchestrator stopped listening.
    pub async fn fact(&self, fact: EngineFact) -> bool {
        self.send(ConsoleStream::Stdout, Ok(ProducerLine::Fact(Box::new(fact))))
            .await
    }

    /// Sends a free-text line.
    pub async fn text(&self, stream: ConsoleStream, message: impl Into<String>) -> bool {
        self.send(stream, Ok(ProducerLine::Text(message.into())))
            .await
    }

    /// Classifies and sends a raw line.
    pub async fn line(&self, stream: ConsoleStream, raw: &str) -> bool {
        self.send(stream, classify_line(raw)).await
    }

    async fn send(&self, stream: ConsoleStream, line: Result<ProducerLine, MalformedLine>) -> bool {
        self.tx.send(OutputItem { stream, line }).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_text() {
        assert_eq!(
            classify_line("Collecting pandas\n").unwrap(),
            ProducerLine::Text("Collecting pandas".into())
        );
        assert_eq!(
            classify_line("").unwrap(),
            ProducerLine::Text(String::new())
        );
    }

    #[test]
    fn structured_lines_become_facts() {
        let line = r#"{"fact":"phase_started","phase":"detect"}"#;
        assert_eq!(
            classify_line(line).unwrap(),
            ProducerLine::Fact(Box::new(EngineFact::PhaseStarted {
                phase: "detect".into()
            }))
        );

        let table = r#"{"fact":"table_completed","table":{"workbook":"a.xlsx","sheet":"S","region":{"first_row":1,"last_row":3,"first_column":1,"last_column":2}}}"#;
        match classify_line(table).unwrap() {
            ProducerLine::Fact(f) => assert!(matches!(*f, EngineFact::TableCompleted { .. })),
            other => panic!("expected fact, got {other:?}"),
        }
    }

    #[test]
    fn broken_structured_lines_are_malformed() {
        for bad in [
            r#"{"fact":"phase_started""#,
            r#"{"fact":"teleported"}"#,
            r#"{"fact":"phase_started","phase":"x","extra":1}"#,
        ] {
            let err = classify_line(bad).unwrap_err();
            assert_eq!(err.line, bad);
            assert!(!err.reason.is_empty());
        }
    }

    #[tokio::test]
    async fn output_classifies_raw_lines() {
        let (out, mut rx) = ProducerOutput::channel(4);
        assert!(out.line(ConsoleStream::Stdout, "hello").await);
        assert!(out.line(ConsoleStream::Stdout, "{nope").await);
        drop(out);

        let a = rx.recv().await.unwrap();
        assert!(matches!(a.line, Ok(ProducerLine::Text(_))));
        let b = rx.recv().await.unwrap();
        assert!(b.line.is_err());
        assert!(rx.recv().await.is_none());
    }
}
