//! # RunService: the public face of the orchestrator.
//!
//! Owns the [`Dispatcher`], the [`RunStore`], the run registry and the
//! collaborators (extraction engine, build executor). Creating a run persists
//! its record, opens its event channel, emits `run.queued` as sequence 1 and
//! spawns its actor.
//!
//! ```text
//! create_run(req)
//!   ├─► decide_build(mode, options, is_cached(fingerprint))
//!   ├─► store.insert(queued record)
//!   ├─► dispatcher.open_run(events_path)
//!   ├─► emit run.queued            (sequence 1)
//!   └─► registry.spawn(RunActor)   (acquires a concurrency slot)
//!
//! shutdown()
//!   ├─► stop accepting runs
//!   ├─► cancel every run, wait up to cfg.grace
//!   │     └─ timeout → RunError::GraceExceeded { stuck }
//!   └─► drain observers
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use runvisor::{Config, RunService, RunRequest, CommandEngine, CommandBuildExecutor};
//!
//! # async fn demo() -> Result<(), runvisor::RunError> {
//! let cfg = Config::default();
//! let service = RunService::builder(
//!     cfg,
//!     Arc::new(CommandEngine::new("/usr/local/bin/extract")),
//!     Arc::new(CommandBuildExecutor::new("/var/cache/envs")),
//! )
//! .build();
//!
//! let handle = service.create_run(RunRequest::new("ws-1", "cfg-1")).await?;
//! let record = service.wait_for(&handle.run_id).await?;
//! println!("{} finished as {:?}", record.run_id, record.status);
//! service.shutdown().await
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::value::RawValue;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{RunError, StoreError};
use crate::eventlog::{self, EventPage};
use crate::ids::{BuildId, RunId};
use crate::schema::payloads::RunQueuedV1;
use crate::schema::{EventSource, SchemaRegistry};
use crate::store::{FileRunStore, RunStore};
use crate::stream::{Cursor, EventStream};
use crate::subscribers::Subscribe;

use super::actor::RunActor;
use super::engine::{BuildExecutor, ExtractionEngine};
use super::finalize::Finalizer;
use super::model::{
    BuildDecisionKind, BuildRecord, BuildStatus, Failure, FailureStage, RunHandle, RunMode,
    RunRecord, RunRequest, RunStatus, decide_build,
};
use super::registry::RunRegistry;
use super::signals;

struct Inner {
    cfg: Config,
    dispatcher: Dispatcher,
    store: Arc<dyn RunStore>,
    registry: Arc<RunRegistry>,
    engine: Arc<dyn ExtractionEngine>,
    build_executor: Arc<dyn BuildExecutor>,
    semaphore: Option<Arc<Semaphore>>,
    accepting: AtomicBool,
}

/// Creates, observes and cancels runs. Cheap to clone.
#[derive(Clone)]
pub struct RunService {
    inner: Arc<Inner>,
}

/// Builder for [`RunService`].
pub struct RunServiceBuilder {
    cfg: Config,
    engine: Arc<dyn ExtractionEngine>,
    build_executor: Arc<dyn BuildExecutor>,
    store: Option<Arc<dyn RunStore>>,
    schemas: Option<SchemaRegistry>,
    observers: Vec<Arc<dyn Subscribe>>,
}

impl RunServiceBuilder {
    /// Replaces the default file-backed run store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the built-in schema registry.
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// Adds process-wide envelope observers.
    pub fn with_observers(mut self, observers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.observers.extend(observers);
        self
    }

    /// Builds the service. Must be called inside a tokio runtime when
    /// observers are configured.
    pub fn build(self) -> RunService {
        let schemas = self.schemas.unwrap_or_else(SchemaRegistry::with_builtin);
        let dispatcher = Dispatcher::with_observers(schemas, &self.cfg, self.observers);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileRunStore::new(self.cfg.data_dir.clone())));
        let semaphore = self
            .cfg
            .concurrency_limit()
            .map(|n| Arc::new(Semaphore::new(n)));

        RunService {
            inner: Arc::new(Inner {
                cfg: self.cfg,
                dispatcher,
                store,
                registry: RunRegistry::new(),
                engine: self.engine,
                build_executor: self.build_executor,
                semaphore,
                accepting: AtomicBool::new(true),
            }),
        }
    }
}

impl RunService {
    /// Starts building a service around an engine and a build executor.
    pub fn builder(
        cfg: Config,
        engine: Arc<dyn ExtractionEngine>,
        build_executor: Arc<dyn BuildExecutor>,
    ) -> RunServiceBuilder {
        RunServiceBuilder {
            cfg,
            engine,
            build_executor,
            store: None,
            schemas: None,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Creates a run and starts it in the background.
    pub async fn create_run(&self, request: RunRequest) -> Result<RunHandle, RunError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(RunError::ShuttingDown);
        }

        let run_id = RunId::generate();
        let options = &request.options;
        let check_cache =
            !(options.skip_build || options.force_rebuild || request.mode == RunMode::DryRun);
        let cached = check_cache
            && self
                .inner
                .build_executor
                .is_cached(options.environment_fingerprint.as_deref())
                .await;
        let decision = decide_build(request.mode, options, cached);

        let events_path = self.inner.cfg.events_path(run_id.as_str());
        let mut record = RunRecord::queued(run_id.clone(), &request, events_path.clone());
        let build_id = match (decision.kind, decision.reason) {
            (BuildDecisionKind::Skip, _) | (_, None) => None,
            (_, Some(reason)) => {
                let id = BuildId::generate();
                record.build = Some(BuildRecord {
                    build_id: id.clone(),
                    reason,
                    status: BuildStatus::Queued,
                    started_at: None,
                    completed_at: None,
                });
                Some(id)
            }
        };
        self.inner.store.insert(record).await?;

        self.inner.dispatcher.open_run(&run_id, &events_path).await;
        let (run, status) = Finalizer::new(
            run_id.clone(),
            events_path,
            self.inner.cfg.mapping,
            self.inner.dispatcher.clone(),
            Arc::clone(&self.inner.store),
        );

        let queued = RunQueuedV1 {
            workspace_id: request.workspace_id.clone(),
            configuration_id: request.configuration_id.clone(),
            mode: request.mode,
            build: decision.kind,
        };
        if let Err(e) = self
            .inner
            .dispatcher
            .emit(&run_id, EventSource::Orchestrator, None, &queued)
            .await
        {
            run.finalize(
                RunStatus::Failed,
                Some(Failure::new(
                    FailureStage::Orchestration,
                    e.as_label(),
                    e.to_string(),
                )),
            )
            .await;
            return Err(e.into());
        }

        tracing::info!(
            run_id = %run_id,
            workspace_id = %request.workspace_id,
            configuration_id = %request.configuration_id,
            mode = request.mode.as_str(),
            build = ?decision.kind,
            "run queued"
        );

        let actor = RunActor {
            run,
            request,
            decision,
            build_id: build_id.clone(),
            engine: Arc::clone(&self.inner.engine),
            builder: Arc::clone(&self.inner.build_executor),
            semaphore: self.inner.semaphore.clone(),
            output_capacity: self.inner.cfg.engine_output_capacity,
            run_dir: self.inner.cfg.run_dir(run_id.as_str()),
        };
        self.inner
            .registry
            .spawn(run_id.clone(), actor, status)
            .await;

        Ok(RunHandle {
            run_id,
            build_id,
            status: RunStatus::Queued,
        })
    }

    /// Current metadata of a run.
    pub async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, RunError> {
        self.inner.store.get(run_id).await.map_err(not_found)
    }

    /// Report bytes exactly as emitted in `run.completed`; `None` until terminal.
    pub async fn get_report(&self, run_id: &RunId) -> Result<Option<Box<RawValue>>, RunError> {
        Ok(self.get_run(run_id).await?.report)
    }

    /// One page of persisted events after `after_sequence`.
    pub async fn events_page(
        &self,
        run_id: &RunId,
        after_sequence: u64,
        limit: usize,
    ) -> Result<EventPage, RunError> {
        let record = self.get_run(run_id).await?;
        let limit = self.inner.cfg.page_size(limit);
        Ok(eventlog::read_page(&record.events_path, after_sequence, limit).await?)
    }

    /// Replay-then-live stream of a run, starting after `cursor`.
    pub async fn stream_events(&self, run_id: &RunId, cursor: Cursor) -> Result<EventStream, RunError> {
        let record = self.get_run(run_id).await?;
        Ok(EventStream::new(
            self.inner.dispatcher.clone(),
            record.run_id,
            record.events_path,
            cursor,
            self.inner.cfg.max_stream_resyncs,
        ))
    }

    /// Like [`stream_events`](Self::stream_events), resuming from an opaque token.
    pub async fn resume_events(&self, run_id: &RunId, token: Option<&str>) -> Result<EventStream, RunError> {
        let cursor = match token {
            Some(t) => Cursor::from_token(t)?,
            None => Cursor::START,
        };
        self.stream_events(run_id, cursor).await
    }

    /// Requests cancellation. Returns `false` when the run is no longer active.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<bool, RunError> {
        self.get_run(run_id).await?;
        let cancelled = self.inner.registry.cancel(run_id).await;
        if cancelled {
            tracing::info!(run_id = %run_id, "run cancellation requested");
        }
        Ok(cancelled)
    }

    /// Waits until the run is terminal and returns its final record.
    pub async fn wait_for(&self, run_id: &RunId) -> Result<RunRecord, RunError> {
        if let Some(mut rx) = self.inner.registry.status_watch(run_id).await {
            // A dropped sender means the run finished; the store has the outcome.
            let _ = rx.wait_for(RunStatus::is_terminal).await;
        }
        self.get_run(run_id).await
    }

    /// Ids of runs whose actors are still active.
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.inner.registry.list().await
    }

    /// Stops accepting runs, cancels active ones and waits up to `cfg.grace`.
    pub async fn shutdown(&self) -> Result<(), RunError> {
        self.inner.accepting.store(false, Ordering::Release);
        tracing::info!("run service shutting down");

        let grace = self.inner.cfg.grace;
        let res = self.inner.registry.shutdown(grace).await;
        self.inner.dispatcher.close_observers().await;

        match res {
            Ok(()) => {
                tracing::info!("all runs stopped within grace");
                Ok(())
            }
            Err(stuck) => {
                tracing::warn!(?grace, ?stuck, "shutdown grace exceeded");
                Err(RunError::GraceExceeded { grace, stuck })
            }
        }
    }

    /// Waits for a termination signal, then shuts down gracefully.
    pub async fn shutdown_on_signal(&self) -> Result<(), RunError> {
        if let Err(e) = signals::wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "signal registration failed; shutting down");
        }
        self.shutdown().await
    }
}

fn not_found(e: StoreError) -> RunError {
    match e {
        StoreError::NotFound { run_id } => RunError::NotFound { run_id },
        other => RunError::Store(other),
    }
}
