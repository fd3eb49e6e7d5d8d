//! # Build → run orchestration.
//!
//! - `model`: run/build state machine, requests, records and failures.
//! - `producer`: classification of engine and build-step output.
//! - `engine`: the [`ExtractionEngine`] and [`BuildExecutor`] seams.
//! - `command`: subprocess implementations of both seams.
//! - [`RunService`]: creates runs and drives each with its own actor.
//!
//! Internals: `actor` (one task per run), `finalize` (single completion),
//! `registry` (active run handles), `signals` (OS shutdown signals).

mod actor;
mod command;
mod engine;
mod finalize;
mod model;
mod producer;
mod registry;
mod service;
mod signals;

pub use command::{CommandBuildExecutor, CommandEngine};
pub use engine::{BuildContext, BuildExecutor, EngineOutcome, EngineRequest, ExtractionEngine};
pub use model::{
    BuildDecision, BuildDecisionKind, BuildPhase, BuildReason, BuildRecord, BuildStatus,
    ConsoleStream, Failure, FailureStage, PhaseStatus, RunHandle, RunMode, RunOptions, RunRecord,
    RunRequest, RunStatus, decide_build,
};
pub use producer::{
    EngineFact, EngineFailure, MalformedLine, OutputItem, ProducerLine, ProducerOutput,
    classify_line,
};
pub use service::{RunService, RunServiceBuilder};
pub use signals::wait_for_shutdown_signal;
