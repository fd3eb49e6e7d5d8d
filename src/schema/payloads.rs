//! # Typed event payloads (schema version 1).
//!
//! One struct per `(type, version)`. Structs are named `<Type>V<version>`;
//! once shipped, a struct is never changed: new fields mean a new struct
//! registered under the next version.
//!
//! | type | source |
//! |---|---|
//! | `run.queued` | orchestrator |
//! | `build.started` / `build.completed` | orchestrator |
//! | `build.phase.started` / `build.phase.completed` | build-step |
//! | `console.line` | build-step, extraction-engine |
//! | `run.started` / `run.warning` / `run.completed` | orchestrator |
//! | `engine.*` | extraction-engine |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::BuildId;
use crate::orchestrator::{
    BuildDecisionKind, BuildPhase, BuildReason, BuildStatus, ConsoleStream, Failure, PhaseStatus,
    RunMode, RunStatus,
};
use crate::report::{Execution, RunReport, TableSummary};

use super::envelope::RUN_COMPLETED;

/// A payload with a fixed registry key.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespaced event type, e.g. `run.started`.
    const TYPE: &'static str;
    /// Schema major version.
    const VERSION: u32 = 1;
}

macro_rules! payload {
    ($ty:ty, $name:expr) => {
        impl EventPayload for $ty {
            const TYPE: &'static str = $name;
        }
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunQueuedV1 {
    pub workspace_id: String,
    pub configuration_id: String,
    pub mode: RunMode,
    pub build: BuildDecisionKind,
}
payload!(RunQueuedV1, "run.queued");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildStartedV1 {
    pub build_id: BuildId,
    pub reason: BuildReason,
}
payload!(BuildStartedV1, "build.started");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPhaseStartedV1 {
    pub phase: BuildPhase,
}
payload!(BuildPhaseStartedV1, "build.phase.started");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPhaseCompletedV1 {
    pub phase: BuildPhase,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
payload!(BuildPhaseCompletedV1, "build.phase.completed");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildCompletedV1 {
    pub build_id: BuildId,
    pub status: BuildStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
payload!(BuildCompletedV1, "build.completed");

/// One attributed stdout/stderr line of a build step or the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleLineV1 {
    pub stream: ConsoleStream,
    pub message: String,
}
payload!(ConsoleLineV1, "console.line");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunStartedV1 {
    pub mode: RunMode,
    pub engine: String,
}
payload!(RunStartedV1, "run.started");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunWarningV1 {
    pub code: String,
    pub message: String,
}
payload!(RunWarningV1, "run.warning");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnginePhaseStartedV1 {
    pub phase: String,
}
payload!(EnginePhaseStartedV1, "engine.phase.started");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnginePhaseCompletedV1 {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
payload!(EnginePhaseCompletedV1, "engine.phase.completed");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineFieldsDeclaredV1 {
    pub fields: Vec<String>,
}
payload!(EngineFieldsDeclaredV1, "engine.fields.declared");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineTableSummarizedV1 {
    pub workbook: String,
    pub sheet: String,
    pub sheet_index: u32,
    pub table: TableSummary,
}
payload!(EngineTableSummarizedV1, "engine.table.summarized");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSheetCompletedV1 {
    pub workbook: String,
    pub sheet: String,
    pub sheet_index: u32,
}
payload!(EngineSheetCompletedV1, "engine.sheet.completed");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineWorkbookCompletedV1 {
    pub workbook: String,
}
payload!(EngineWorkbookCompletedV1, "engine.workbook.completed");

/// Artifacts a run actually produced. Absent artifacts are omitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_path: Option<String>,
}

/// Terminal event of a run; exactly one per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunCompletedV1 {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub execution: Execution,
    pub outputs: RunOutputs,
    /// At least one earlier event of this run could not be persisted.
    pub log_degraded: bool,
    pub report: RunReport,
}
payload!(RunCompletedV1, RUN_COMPLETED);
