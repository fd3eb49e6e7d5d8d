//! # runvisor
//!
//! **Runvisor** orchestrates build-then-run extraction pipelines and gives
//! every run an ordered, durable, replayable event stream that ends in a
//! structured completion report.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  RunService::create_run(RunRequest)
//!        │
//!        ├─► RunStore (run.json)              decide_build(mode, options, cache)
//!        │                                             │
//!        ▼                                             ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  RunActor (one per run)                                           │
//! │  - BuildExecutor phases  ──► build.* / console.line               │
//! │  - ExtractionEngine      ──► engine.* / console.line / run.warning│
//! │  - RunReportBuilder      ◄── table / sheet / workbook facts       │
//! │  - Finalizer             ──► run.completed (exactly once)         │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Dispatcher (per-run channel)                                     │
//! │  validate (SchemaRegistry) → sequence → append NDJSON → fan out   │
//! └──────┬──────────────────────────┬──────────────────────┬──────────┘
//!        ▼                          ▼                      ▼
//!   events.ndjson            live queues (bounded)    SubscriberSet
//!        │                          │                 (observers)
//!        └──────────┬───────────────┘
//!                   ▼
//!          EventStream: replay(log) → live, resumable by Cursor
//! ```
//!
//! ### Run lifecycle
//! ```text
//! queued ──► building ──► running ──► succeeded | failed | cancelled
//!   └──────────────────────┘ (build skipped)
//! ```
//!
//! ## Guarantees
//! - Sequences of a run start at 1 and are gapless; the log order equals the
//!   sequence order.
//! - Every run ends with exactly one `run.completed`, also on panics,
//!   cancellation and dropped actors. Nothing is emitted after it.
//! - A stream resumed from any cursor delivers each later event exactly once.
//! - The stored report is byte-identical to the emitted one.
//!
//! ## Features
//! | Area              | Description                                                | Key types / traits                          |
//! |-------------------|------------------------------------------------------------|---------------------------------------------|
//! | **Schemas**       | Versioned payload registry and envelope.                   | [`SchemaRegistry`], [`Envelope`]            |
//! | **Dispatch**      | Sequencing, durable log, live fan-out.                     | [`Dispatcher`], [`EventLog`]                |
//! | **Streaming**     | Replay-then-live transport with resume cursors.            | [`EventStream`], [`Cursor`]                 |
//! | **Orchestration** | Build → run state machine, cancellation, shutdown.         | [`RunService`], [`RunStatus`]               |
//! | **Collaborators** | Engine and build seams plus subprocess adapters.           | [`ExtractionEngine`], [`BuildExecutor`]     |
//! | **Reports**       | Incremental completion report with rollups and grading.    | [`RunReportBuilder`], [`RunReport`]         |
//! | **Observers**     | Process-wide envelope subscribers.                         | [`Subscribe`], [`LogWriter`]                |
//! | **Configuration** | Centralized runtime settings.                              | [`Config`]                                  |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use runvisor::{
//!     BuildContext, BuildExecutor, BuildPhase, Config, EngineOutcome, EngineRequest,
//!     ExtractionEngine, ProducerOutput, RunRequest, RunService, RunStatus,
//! };
//! use runvisor::error::{BuildError, EngineError};
//! use runvisor::store::MemoryRunStore;
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl ExtractionEngine for Noop {
//!     async fn execute(
//!         &self,
//!         _req: EngineRequest,
//!         _out: ProducerOutput,
//!         _token: CancellationToken,
//!     ) -> Result<EngineOutcome, EngineError> {
//!         Ok(EngineOutcome::default())
//!     }
//! }
//!
//! #[async_trait]
//! impl BuildExecutor for Noop {
//!     async fn is_cached(&self, _fp: Option<&str>) -> bool { true }
//!     async fn run_phase(
//!         &self,
//!         _ctx: &BuildContext,
//!         _phase: BuildPhase,
//!         _out: ProducerOutput,
//!         _token: CancellationToken,
//!     ) -> Result<(), BuildError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = std::env::temp_dir().join(format!("runvisor-doc-{}", std::process::id()));
//!     let cfg = Config { data_dir: dir, ..Config::default() };
//!
//!     let service = RunService::builder(cfg, Arc::new(Noop), Arc::new(Noop))
//!         .with_store(Arc::new(MemoryRunStore::new()))
//!         .build();
//!
//!     let handle = service.create_run(RunRequest::new("ws", "cfg")).await?;
//!     let record = service.wait_for(&handle.run_id).await?;
//!     assert_eq!(record.status, RunStatus::Succeeded);
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod eventlog;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod schema;
pub mod store;
pub mod subscribers;

mod dispatch;
mod ids;
mod stream;

// ---- Public re-exports ----

pub use config::{Config, MappingConfig};
pub use dispatch::{Dispatcher, Subscription};
pub use error::{
    BuildError, DispatchError, EngineError, LogError, RunError, SchemaError, StoreError,
    StreamError,
};
pub use eventlog::{EventLog, EventPage};
pub use ids::{BuildId, RunId};
pub use orchestrator::{
    BuildContext, BuildExecutor, BuildPhase, CommandBuildExecutor, CommandEngine, EngineFact,
    EngineOutcome, EngineRequest, ExtractionEngine, Failure, FailureStage, ProducerOutput,
    RunHandle, RunMode, RunOptions, RunRecord, RunRequest, RunService, RunStatus,
};
pub use report::{RunReport, RunReportBuilder};
pub use schema::{Envelope, EventPayload, EventSource, SchemaRegistry};
pub use stream::{Cursor, EventStream};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
