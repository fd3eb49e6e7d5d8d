//! # Run and build model.
//!
//! ## Run lifecycle
//! ```text
//! queued ──► building ──► running ──► succeeded
//!   │           │            ├──────► failed
//!   │           │            └──────► cancelled
//!   │           ├──► failed | cancelled
//!   ├──► running (build skipped)
//!   └──► failed | cancelled
//! ```
//!
//! ## Rules
//! - Only the run actor moves a run through these states.
//! - Terminal states (`succeeded`, `failed`, `cancelled`) accept no transition.
//! - A run references zero or one build.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::ids::{BuildId, RunId};

/// How the run treats the configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Build (if needed) and run the extraction engine.
    #[default]
    Execute,
    /// Build (if needed) and let the engine validate without producing output.
    ValidateOnly,
    /// No build; the engine plans without touching inputs.
    DryRun,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Execute => "execute",
            RunMode::ValidateOnly => "validate-only",
            RunMode::DryRun => "dry-run",
        }
    }
}

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Building,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// True for `succeeded`, `failed` and `cancelled`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, Building | Running | Failed | Cancelled) => true,
            (Building, Running | Failed | Cancelled) => true,
            (Running, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Building => "building",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a build was (or was not) performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    ForcedRebuild,
    CacheMiss,
    CacheHit,
}

/// What the orchestrator decided to do about the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildDecisionKind {
    /// A cached environment matches; no phases run.
    Reuse,
    /// Phases run.
    Rebuild,
    /// No build at all (dry run or explicit skip).
    Skip,
}

/// Outcome of [`decide_build`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildDecision {
    pub kind: BuildDecisionKind,
    pub reason: Option<BuildReason>,
}

/// Decides whether a run builds, reuses or skips the environment.
///
/// ```text
/// skip_build || dry-run   → skip
/// force_rebuild           → rebuild (forced_rebuild)
/// fingerprint cached      → reuse   (cache_hit)
/// otherwise               → rebuild (cache_miss)
/// ```
pub fn decide_build(mode: RunMode, options: &RunOptions, cached: bool) -> BuildDecision {
    if options.skip_build || mode == RunMode::DryRun {
        return BuildDecision {
            kind: BuildDecisionKind::Skip,
            reason: None,
        };
    }
    if options.force_rebuild {
        return BuildDecision {
            kind: BuildDecisionKind::Rebuild,
            reason: Some(BuildReason::ForcedRebuild),
        };
    }
    if cached {
        BuildDecision {
            kind: BuildDecisionKind::Reuse,
            reason: Some(BuildReason::CacheHit),
        }
    } else {
        BuildDecision {
            kind: BuildDecisionKind::Rebuild,
            reason: Some(BuildReason::CacheMiss),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Succeeded,
    Reused,
    Failed,
    Cancelled,
}

/// Build phases, executed in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    CreateEnvironment,
    InstallDependencies,
    Verify,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 3] = [
        BuildPhase::CreateEnvironment,
        BuildPhase::InstallDependencies,
        BuildPhase::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::CreateEnvironment => "create_environment",
            BuildPhase::InstallDependencies => "install_dependencies",
            BuildPhase::Verify => "verify",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
}

/// Which pipe a console line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Pipeline stage a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Build,
    Execution,
    Orchestration,
}

/// Failure detail carried by the completion event and the run record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Failure {
    pub stage: FailureStage,
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(stage: FailureStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Options that influence the build decision and the engine invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    pub force_rebuild: bool,
    pub skip_build: bool,
    /// Identity of the environment the configuration needs; cache key for builds.
    pub environment_fingerprint: Option<String>,
    /// Opaque engine inputs (document paths, sheet selection...).
    pub inputs: BTreeMap<String, String>,
}

/// Request to create and start a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    pub workspace_id: String,
    pub configuration_id: String,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub options: RunOptions,
}

impl RunRequest {
    pub fn new(workspace_id: impl Into<String>, configuration_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            configuration_id: configuration_id.into(),
            mode: RunMode::Execute,
            options: RunOptions::default(),
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// Returned by run creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<BuildId>,
    pub status: RunStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub reason: BuildReason,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted metadata of one run.
///
/// The report is kept as the exact bytes that were emitted in `run.completed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workspace_id: String,
    pub configuration_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub events_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub log_degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Box<RawValue>>,
}

impl RunRecord {
    /// A fresh queued record.
    pub fn queued(run_id: RunId, request: &RunRequest, events_path: PathBuf) -> Self {
        Self {
            run_id,
            workspace_id: request.workspace_id.clone(),
            configuration_id: request.configuration_id.clone(),
            mode: request.mode,
            status: RunStatus::Queued,
            build: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            events_path,
            failure: None,
            log_degraded: false,
            report: None,
        }
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            run_id: self.run_id.clone(),
            build_id: self.build.as_ref().map(|b| b.build_id.clone()),
            status: self.status,
        }
    }

    /// Report bytes exactly as emitted, if the run is terminal.
    pub fn report_json(&self) -> Option<&str> {
        self.report.as_deref().map(RawValue::get)
    }
}
