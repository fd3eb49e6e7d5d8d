//! # Dispatcher: per-run sequencing, durable append and live fan-out.
//!
//! The [`Dispatcher`] is the only component that allocates event identity
//! (`event_id`, `created_at`, `sequence`) and the only writer of event logs.
//!
//! ## Architecture
//! ```text
//! emit(run_id, type, source, payload)
//!   ├─► registry.validate(type, current_version)     (reject → SchemaError)
//!   └─► lock run channel, hand the guard to an emission task ──────┐
//!         ├─► sequence = last + 1, event_id, created_at            │ per-run
//!         ├─► log.append(envelope)   (failure → degraded, warn)    │ exclusion
//!         ├─► live queues: try_send  (full → disconnect)           │
//!         └─► completion? seal run                                 │
//!       unlock ◄──────────────────────────────────────────────────┘
//!       observers.emit_arc(envelope)
//! ```
//!
//! ## Rules
//! - Runs are independent: own counter, own log, own live queues.
//! - Sequences of one run are `1..=N`, gapless, allocated under the run lock.
//! - A subscriber that falls `subscriber_capacity` events behind is
//!   disconnected; the consumer resyncs from the log.
//! - After `run.completed` a run is sealed; later emissions are rejected.
//! - Dropping a [`Subscription`] unregisters only its own queue.
//! - An emission that acquired the run lock always finishes, even when the
//!   caller's future is dropped: every logged envelope reaches the live queues.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::DispatchError;
use crate::eventlog::EventLog;
use crate::ids::{BuildId, RunId, new_event_id};
use crate::schema::{Envelope, EventPayload, EventSource, SchemaRegistry};
use crate::subscribers::{Subscribe, SubscriberSet};

/// Live receiver registered on one run.
///
/// `high_water` is the last sequence dispatched before registration: every
/// envelope with a greater sequence is delivered to this queue (until it is
/// disconnected), every envelope up to it must be replayed from the log.
pub struct Subscription {
    pub high_water: u64,
    rx: mpsc::Receiver<Arc<Envelope>>,
}

impl Subscription {
    /// Next live envelope; `None` once the queue was closed (run closed or
    /// subscriber disconnected on overflow).
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.rx.recv().await
    }
}

struct LiveQueue {
    id: u64,
    tx: mpsc::Sender<Arc<Envelope>>,
}

struct RunState {
    last_sequence: u64,
    log: Option<EventLog>,
    degraded: bool,
    completed: bool,
    next_queue_id: u64,
    queues: Vec<LiveQueue>,
}

impl RunState {
    fn fan_out(&mut self, run_id: &RunId, env: &Arc<Envelope>) {
        self.queues.retain(|q| match q.tx.try_send(Arc::clone(env)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    run_id = %run_id,
                    subscriber = q.id,
                    sequence = env.sequence,
                    "live subscriber overflow; disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

struct RunChannel {
    state: Arc<tokio::sync::Mutex<RunState>>,
}

struct Inner {
    registry: SchemaRegistry,
    capacity: usize,
    sync_log: bool,
    runs: Mutex<HashMap<RunId, Arc<RunChannel>>>,
    observers: Option<SubscriberSet>,
}

/// Cloneable handle to the process-wide dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Creates a dispatcher without observers.
    pub fn new(registry: SchemaRegistry, cfg: &Config) -> Self {
        Self::with_observers(registry, cfg, Vec::new())
    }

    /// Creates a dispatcher with process-wide envelope observers.
    ///
    /// Must be called inside a tokio runtime when `observers` is not empty.
    pub fn with_observers(
        registry: SchemaRegistry,
        cfg: &Config,
        observers: Vec<Arc<dyn Subscribe>>,
    ) -> Self {
        let observers = (!observers.is_empty()).then(|| SubscriberSet::new(observers));
        Self {
            inner: Arc::new(Inner {
                registry,
                capacity: cfg.subscriber_capacity_clamped(),
                sync_log: cfg.sync_log,
                runs: Mutex::new(HashMap::new()),
                observers,
            }),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// Opens a run for emission.
    ///
    /// An existing log at `log_path` is scanned and the counter resumes after
    /// its last sequence. If the log cannot be opened the run is still opened,
    /// with degraded logging. Opening an already open run is a no-op.
    pub async fn open_run(&self, run_id: &RunId, log_path: &Path) {
        if self.channel(run_id).is_some() {
            return;
        }

        let (log, degraded, last_sequence) = match EventLog::open(log_path, self.inner.sync_log).await {
            Ok(log) => {
                let last = log.last_sequence();
                (Some(log), false, last)
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    path = %log_path.display(),
                    error = %e,
                    label = e.as_label(),
                    "event log unavailable; run continues with degraded logging"
                );
                (None, true, 0)
            }
        };

        let channel = Arc::new(RunChannel {
            state: Arc::new(tokio::sync::Mutex::new(RunState {
                last_sequence,
                log,
                degraded,
                completed: false,
                next_queue_id: 0,
                queues: Vec::new(),
            })),
        });

        if let Ok(mut runs) = self.inner.runs.lock() {
            runs.entry(run_id.clone()).or_insert(channel);
        }
    }

    /// Emits a typed payload at its own schema version.
    pub async fn emit<P: EventPayload>(
        &self,
        run_id: &RunId,
        source: EventSource,
        build_id: Option<&BuildId>,
        payload: &P,
    ) -> Result<Arc<Envelope>, DispatchError> {
        let value = serde_json::to_value(payload)?;
        self.dispatch(run_id, P::TYPE, P::VERSION, source, build_id, value)
            .await
    }

    /// Emits a dynamic payload at the type's current schema version.
    pub async fn emit_value(
        &self,
        run_id: &RunId,
        event_type: &str,
        source: EventSource,
        build_id: Option<&BuildId>,
        payload: Value,
    ) -> Result<Arc<Envelope>, DispatchError> {
        let version = self.inner.registry.current_version(event_type)?;
        self.dispatch(run_id, event_type, version, source, build_id, payload)
            .await
    }

    async fn dispatch(
        &self,
        run_id: &RunId,
        event_type: &str,
        version: u32,
        source: EventSource,
        build_id: Option<&BuildId>,
        payload: Value,
    ) -> Result<Arc<Envelope>, DispatchError> {
        let payload = self.inner.registry.validate(event_type, version, payload)?;
        let channel = self
            .channel(run_id)
            .ok_or_else(|| DispatchError::RunNotOpen {
                run_id: run_id.clone(),
            })?;

        let mut st = Arc::clone(&channel.state).lock_owned().await;
        if st.completed {
            return Err(DispatchError::RunCompleted {
                run_id: run_id.clone(),
                event_type: event_type.to_owned(),
            });
        }

        // Once the lock is held the emission runs to completion on its own
        // task: a caller dropped mid-append cannot leave a logged envelope
        // that live queues never saw.
        let inner = Arc::clone(&self.inner);
        let owned_run = run_id.clone();
        let event_type = event_type.to_owned();
        let build_id = build_id.cloned();
        let task = tokio::spawn(async move {
            let run_id = owned_run;
            st.last_sequence += 1;
            let env = Arc::new(Envelope {
                event_type,
                schema_version: version,
                event_id: new_event_id(),
                created_at: Utc::now(),
                sequence: st.last_sequence,
                source,
                run_id: run_id.clone(),
                build_id,
                payload,
            });

            let appended = match st.log.as_mut() {
                Some(log) => log.append(&env).await,
                None => Ok(()),
            };
            if let Err(e) = appended {
                tracing::warn!(
                    run_id = %run_id,
                    sequence = env.sequence,
                    event_type = %env.event_type,
                    error = %e,
                    "event log append failed; logging degraded"
                );
                st.degraded = true;
            }

            if env.is_completion() {
                st.completed = true;
            }
            st.fan_out(&run_id, &env);
            drop(st);

            if let Some(obs) = &inner.observers {
                obs.emit_arc(Arc::clone(&env));
            }
            env
        });

        task.await.map_err(|e| DispatchError::Interrupted {
            run_id: run_id.clone(),
            message: e.to_string(),
        })
    }

    /// Registers a live queue on an open run.
    ///
    /// Returns `None` when the run is not open (never opened, or closed).
    pub async fn subscribe(&self, run_id: &RunId) -> Option<Subscription> {
        let channel = self.channel(run_id)?;
        let mut st = channel.state.lock().await;
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = st.next_queue_id;
        st.next_queue_id += 1;
        st.queues.push(LiveQueue { id, tx });
        Some(Subscription {
            high_water: st.last_sequence,
            rx,
        })
    }

    /// Closes a run: removes it from the arena and closes every live queue
    /// (consumers drain what was already queued, then observe closure).
    pub async fn close_run(&self, run_id: &RunId) {
        let channel = match self.inner.runs.lock() {
            Ok(mut runs) => runs.remove(run_id),
            Err(_) => None,
        };
        if let Some(channel) = channel {
            let mut st = channel.state.lock().await;
            st.queues.clear();
            st.log = None;
        }
    }

    pub fn is_open(&self, run_id: &RunId) -> bool {
        self.channel(run_id).is_some()
    }

    /// Whether any append of an open run failed.
    pub async fn is_degraded(&self, run_id: &RunId) -> Option<bool> {
        let channel = self.channel(run_id)?;
        let st = channel.state.lock().await;
        Some(st.degraded)
    }

    /// Last sequence dispatched for an open run.
    pub async fn last_sequence(&self, run_id: &RunId) -> Option<u64> {
        let channel = self.channel(run_id)?;
        let st = channel.state.lock().await;
        Some(st.last_sequence)
    }

    /// Number of live queues registered on an open run.
    pub async fn live_subscribers(&self, run_id: &RunId) -> usize {
        match self.channel(run_id) {
            Some(c) => c.state.lock().await.queues.len(),
            None => 0,
        }
    }

    /// Closes observer queues and waits for observers to drain.
    pub async fn close_observers(&self) {
        if let Some(obs) = &self.inner.observers {
            obs.close().await;
        }
    }

    fn channel(&self, run_id: &RunId) -> Option<Arc<RunChannel>> {
        self.inner
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog;
    use crate::schema::payloads::{ConsoleLineV1, RunWarningV1};
    use crate::orchestrator::ConsoleStream;
    use serde_json::json;

    fn warning(code: &str) -> RunWarningV1 {
        RunWarningV1 {
            code: code.into(),
            message: "m".into(),
        }
    }

    fn cfg(capacity: usize) -> Config {
        Config {
            subscriber_capacity: capacity,
            sync_log: false,
            ..Config::default()
        }
    }

    async fn open(cap: usize) -> (tempfile::TempDir, Dispatcher, RunId, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let d = Dispatcher::new(SchemaRegistry::with_builtin(), &cfg(cap));
        let run = RunId::generate();
        let path = dir.path().join("events.ndjson");
        d.open_run(&run, &path).await;
        (dir, d, run, path)
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_are_persisted() {
        let (_dir, d, run, path) = open(16).await;
        for i in 0..3 {
            let env = d
                .emit(&run, EventSource::Orchestrator, None, &warning(&format!("w{i}")))
                .await
                .unwrap();
            assert_eq!(env.sequence, i + 1);
        }
        let seqs: Vec<u64> = eventlog::read_all(&path)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrent_producers_stay_gapless() {
        let (_dir, d, run, path) = open(1024).await;
        let mut handles = Vec::new();
        for p in 0..8 {
            let d = d.clone();
            let run = run.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    d.emit(
                        &run,
                        EventSource::ExtractionEngine,
                        None,
                        &ConsoleLineV1 {
                            stream: ConsoleStream::Stdout,
                            message: format!("p{p} line {i}"),
                        },
                    )
                    .await
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let seqs: Vec<u64> = eventlog::read_all(&path)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_without_consuming_a_sequence() {
        let (_dir, d, run, _path) = open(16).await;
        let err = d
            .emit_value(
                &run,
                "run.warning",
                EventSource::Orchestrator,
                None,
                json!({"code": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "schema_invalid_payload");

        let env = d
            .emit(&run, EventSource::Orchestrator, None, &warning("ok"))
            .await
            .unwrap();
        assert_eq!(env.sequence, 1);
    }

    #[tokio::test]
    async fn unknown_run_is_rejected() {
        let d = Dispatcher::new(SchemaRegistry::with_builtin(), &cfg(4));
        let err = d
            .emit(&RunId::from("nope"), EventSource::Orchestrator, None, &warning("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RunNotOpen { .. }));
        assert!(d.subscribe(&RunId::from("nope")).await.is_none());
    }

    #[tokio::test]
    async fn subscribers_get_events_after_high_water() {
        let (_dir, d, run, _path) = open(16).await;
        d.emit(&run, EventSource::Orchestrator, None, &warning("a"))
            .await
            .unwrap();
        let mut sub = d.subscribe(&run).await.unwrap();
        assert_eq!(sub.high_water, 1);
        d.emit(&run, EventSource::Orchestrator, None, &warning("b"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_blocking() {
        let (_dir, d, run, _path) = open(2).await;
        let mut slow = d.subscribe(&run).await.unwrap();
        let mut fast = d.subscribe(&run).await.unwrap();

        for i in 0..2 {
            d.emit(&run, EventSource::Orchestrator, None, &warning(&i.to_string()))
                .await
                .unwrap();
            assert_eq!(fast.recv().await.unwrap().sequence, i + 1);
        }
        // Third emission overflows the slow queue only.
        d.emit(&run, EventSource::Orchestrator, None, &warning("x"))
            .await
            .unwrap();
        assert_eq!(fast.recv().await.unwrap().sequence, 3);
        assert_eq!(d.live_subscribers(&run).await, 1);

        assert_eq!(slow.recv().await.unwrap().sequence, 1);
        assert_eq!(slow.recv().await.unwrap().sequence, 2);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn abandoned_emission_still_reaches_live_queues() {
        let (_dir, d, run, path) = open(16).await;
        let mut sub = d.subscribe(&run).await.unwrap();

        // The caller gives up after the first poll, while the append is pending.
        let first = tokio::time::timeout(
            std::time::Duration::ZERO,
            d.emit(&run, EventSource::Orchestrator, None, &warning("a")),
        )
        .await;
        assert!(first.is_err());

        let second = d
            .emit(&run, EventSource::Orchestrator, None, &warning("b"))
            .await
            .unwrap();
        assert_eq!(second.sequence, 2);

        assert_eq!(sub.recv().await.unwrap().sequence, 1);
        assert_eq!(sub.recv().await.unwrap().sequence, 2);
        let seqs: Vec<u64> = eventlog::read_all(&path)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let (_dir, d, run, _path) = open(4).await;
        let a = d.subscribe(&run).await.unwrap();
        let _b = d.subscribe(&run).await.unwrap();
        drop(a);
        d.emit(&run, EventSource::Orchestrator, None, &warning("x"))
            .await
            .unwrap();
        assert_eq!(d.live_subscribers(&run).await, 1);
    }

    #[tokio::test]
    async fn reopen_resumes_counter() {
        let (_dir, d, run, path) = open(4).await;
        d.emit(&run, EventSource::Orchestrator, None, &warning("a"))
            .await
            .unwrap();
        d.close_run(&run).await;
        assert!(!d.is_open(&run));

        d.open_run(&run, &path).await;
        let env = d
            .emit(&run, EventSource::Orchestrator, None, &warning("b"))
            .await
            .unwrap();
        assert_eq!(env.sequence, 2);
    }

    #[tokio::test]
    async fn unwritable_log_degrades_but_emits() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let d = Dispatcher::new(SchemaRegistry::with_builtin(), &cfg(4));
        let run = RunId::generate();
        // Parent is a regular file: the log cannot be created.
        d.open_run(&run, &blocker.join("events.ndjson")).await;

        let env = d
            .emit(&run, EventSource::Orchestrator, None, &warning("a"))
            .await
            .unwrap();
        assert_eq!(env.sequence, 1);
        assert_eq!(d.is_degraded(&run).await, Some(true));
    }
}
