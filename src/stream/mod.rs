//! # Replay → live event streaming.
//!
//! An [`EventStream`] presents a run's persisted history and its live tail as
//! one ordered sequence, starting after a [`Cursor`].
//!
//! ## Phases
//! ```text
//! Connect ──► subscribe (live queue, high_water) + open log reader
//!    │
//! Replay  ──► log lines with cursor < seq ≤ high_water
//!    │          (no live run: replay to end of log, then Done)
//!    ▼
//! Live    ──► queue items with seq > cursor (dedupe)
//!    │          queue closed without completion → resync (back to Connect)
//!    ▼
//! Done    ◄── after run.completed, or after too many resyncs (Lagged)
//! ```
//!
//! ## Rules
//! - Subscribing happens before the replay scan finishes, so nothing emitted
//!   in between is lost; duplicates are removed by sequence.
//! - Resuming at cursor `k` yields `k+1` onward.
//! - Gaps (events that could not be persisted while the log was degraded) are
//!   logged, never fatal.
//! - Dropping the stream unregisters only its own live queue.

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;

use crate::dispatch::{Dispatcher, Subscription};
use crate::error::StreamError;
use crate::eventlog::EventLogReader;
use crate::ids::RunId;
use crate::schema::Envelope;

pub use crate::eventlog::EventPage;

const TOKEN_PREFIX: &str = "v1.";

/// Position in a run's event sequence: everything up to and including
/// `after_sequence` has been seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub after_sequence: u64,
}

impl Cursor {
    /// Start of the run.
    pub const START: Cursor = Cursor { after_sequence: 0 };

    pub fn after(sequence: u64) -> Self {
        Self {
            after_sequence: sequence,
        }
    }

    /// Opaque resume token.
    pub fn token(&self) -> String {
        format!("{TOKEN_PREFIX}{:x}", self.after_sequence)
    }

    /// Parses a token produced by [`Cursor::token`].
    pub fn from_token(token: &str) -> Result<Self, StreamError> {
        token
            .strip_prefix(TOKEN_PREFIX)
            .filter(|hex| !hex.is_empty())
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(Self::after)
            .ok_or_else(|| StreamError::InvalidCursor {
                token: token.to_owned(),
            })
    }
}

enum Phase {
    Connect,
    Replay {
        reader: EventLogReader,
        sub: Option<Subscription>,
    },
    Live {
        sub: Subscription,
    },
    Done,
}

/// Request-scoped replay → live stream of one run.
pub struct EventStream {
    dispatcher: Dispatcher,
    run_id: RunId,
    log_path: PathBuf,
    cursor: u64,
    resyncs: u32,
    max_resyncs: u32,
    phase: Phase,
}

impl EventStream {
    pub fn new(
        dispatcher: Dispatcher,
        run_id: RunId,
        log_path: PathBuf,
        cursor: Cursor,
        max_resyncs: u32,
    ) -> Self {
        Self {
            dispatcher,
            run_id,
            log_path,
            cursor: cursor.after_sequence,
            resyncs: 0,
            max_resyncs,
            phase: Phase::Connect,
        }
    }

    /// Cursor after the last delivered envelope.
    pub fn cursor(&self) -> Cursor {
        Cursor::after(self.cursor)
    }

    /// Next envelope; `None` once the stream is done.
    pub async fn next(&mut self) -> Option<Result<Arc<Envelope>, StreamError>> {
        loop {
            match &mut self.phase {
                Phase::Done => return None,

                Phase::Connect => {
                    let sub = self.dispatcher.subscribe(&self.run_id).await;
                    match EventLogReader::open(&self.log_path).await {
                        Ok(reader) => self.phase = Phase::Replay { reader, sub },
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Some(Err(e.into()));
                        }
                    }
                }

                Phase::Replay { reader, sub } => {
                    let high_water = sub.as_ref().map(|s| s.high_water);
                    match reader.next().await {
                        Ok(Some(env)) => {
                            if env.sequence <= self.cursor {
                                continue;
                            }
                            if high_water.is_some_and(|hw| env.sequence > hw) {
                                self.go_live();
                                continue;
                            }
                            return self.deliver(Arc::new(env));
                        }
                        Ok(None) => {
                            if let Some(hw) = high_water.filter(|hw| *hw > self.cursor) {
                                tracing::warn!(
                                    run_id = %self.run_id,
                                    after_sequence = self.cursor,
                                    high_water = hw,
                                    "event log ends before live high-water mark"
                                );
                            }
                            if high_water.is_some() {
                                self.go_live();
                            } else {
                                self.phase = Phase::Done;
                            }
                        }
                        Err(e) => {
                            self.phase = Phase::Done;
                            return Some(Err(e.into()));
                        }
                    }
                }

                Phase::Live { sub } => match sub.recv().await {
                    Some(env) => {
                        if env.sequence <= self.cursor {
                            continue;
                        }
                        return self.deliver(env);
                    }
                    None => {
                        self.resyncs += 1;
                        if self.resyncs > self.max_resyncs {
                            self.phase = Phase::Done;
                            return Some(Err(StreamError::Lagged {
                                after_sequence: self.cursor,
                            }));
                        }
                        tracing::debug!(
                            run_id = %self.run_id,
                            after_sequence = self.cursor,
                            resync = self.resyncs,
                            "live queue closed; resyncing from log"
                        );
                        self.phase = Phase::Connect;
                    }
                },
            }
        }
    }

    /// Adapts the stream to [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Arc<Envelope>, StreamError>> + Send {
        futures::stream::unfold(self, |mut s| async move {
            let item = s.next().await?;
            Some((item, s))
        })
    }

    fn go_live(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Done);
        if let Phase::Replay { sub: Some(sub), .. } = phase {
            self.phase = Phase::Live { sub };
        }
    }

    fn deliver(&mut self, env: Arc<Envelope>) -> Option<Result<Arc<Envelope>, StreamError>> {
        if env.sequence != self.cursor + 1 {
            tracing::warn!(
                run_id = %self.run_id,
                expected = self.cursor + 1,
                got = env.sequence,
                "sequence gap in event stream"
            );
        }
        self.cursor = env.sequence;
        if env.is_completion() {
            self.phase = Phase::Done;
        }
        Some(Ok(env))
    }
}
