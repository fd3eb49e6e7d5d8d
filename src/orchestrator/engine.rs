//! # External collaborators: extraction engine and build executor.
//!
//! Both are traits so hosts can plug in subprocess adapters
//! ([`CommandEngine`](super::CommandEngine),
//! [`CommandBuildExecutor`](super::CommandBuildExecutor)) or in-process
//! implementations.
//!
//! ## Rules
//! - Implementations report progress only through their [`ProducerOutput`];
//!   they never emit events themselves.
//! - Implementations should observe the [`CancellationToken`]; a run that is
//!   cancelled also drops the in-flight future.
//! - Failures are returned as typed errors and become completion failure
//!   detail; they are never transport errors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, EngineError};
use crate::ids::{BuildId, RunId};

use super::model::{BuildPhase, RunMode};
use super::producer::ProducerOutput;

/// Everything the engine needs to execute one run.
#[derive(Clone, Debug, Serialize)]
pub struct EngineRequest {
    pub run_id: RunId,
    pub workspace_id: String,
    pub configuration_id: String,
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<BuildId>,
    pub inputs: BTreeMap<String, String>,
    /// Directory the engine may write artifacts into.
    pub output_dir: PathBuf,
}

/// What a finished engine hands back besides its facts.
#[derive(Clone, Debug, Default)]
pub struct EngineOutcome {
    /// Normalized output artifact, if one was written.
    pub normalized_path: Option<PathBuf>,
}

/// The document extraction engine.
#[async_trait]
pub trait ExtractionEngine: Send + Sync + 'static {
    /// Name reported in `run.started`.
    fn name(&self) -> &str {
        "engine"
    }

    /// Executes the run, streaming facts and console lines into `output`.
    async fn execute(
        &self,
        request: EngineRequest,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<EngineOutcome, EngineError>;
}

/// Context of one environment build.
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub run_id: RunId,
    pub build_id: BuildId,
    pub configuration_id: String,
    pub fingerprint: Option<String>,
    pub workdir: PathBuf,
}

/// Provisions the environment an engine runs in.
#[async_trait]
pub trait BuildExecutor: Send + Sync + 'static {
    /// Whether an environment for this fingerprint is already available.
    async fn is_cached(&self, fingerprint: Option<&str>) -> bool;

    /// Runs one build phase to completion.
    async fn run_phase(
        &self,
        ctx: &BuildContext,
        phase: BuildPhase,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<(), BuildError>;
}
