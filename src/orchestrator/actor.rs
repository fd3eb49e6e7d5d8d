//! # RunActor: drives one run from queued to terminal.
//!
//! ```text
//! RunActor::run(token)
//!   ├─► acquire semaphore (cancellable)
//!   ├─► drive() under catch_unwind, raced against token.cancelled()
//!   │     ├─ rebuild → building: build.started, per phase
//!   │     │            build.phase.started/completed, console.line
//!   │     ├─ reuse   → build.started(cache_hit) + build.completed(reused)
//!   │     ├─ running → run.started
//!   │     └─ engine.execute() while draining producer output:
//!   │          fact ──► report builder + engine.* event
//!   │          text ──► console.line
//!   │          malformed ──► run.warning
//!   └─► finalize(status, failure)  (exactly once; guard covers drops)
//! ```
//!
//! ## Rules
//! - Every exit path ends in exactly one `run.completed`: success, stage
//!   failure, cancellation, panic or a dropped task.
//! - Emission problems inside the run are logged, never fatal.
//! - Producer output is fully drained before the terminal status is decided.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ids::BuildId;
use crate::schema::EventSource;
use crate::schema::payloads::{
    BuildPhaseCompletedV1, BuildPhaseStartedV1, ConsoleLineV1, EngineFieldsDeclaredV1,
    EnginePhaseCompletedV1, EnginePhaseStartedV1, EngineSheetCompletedV1,
    EngineTableSummarizedV1, EngineWorkbookCompletedV1, RunStartedV1, RunWarningV1,
};

use super::engine::{BuildContext, BuildExecutor, EngineRequest, ExtractionEngine};
use super::finalize::{FinalizeGuard, Finalizer};
use super::model::{
    BuildDecision, BuildDecisionKind, BuildPhase, BuildReason, BuildStatus, Failure,
    FailureStage, PhaseStatus, RunRequest, RunStatus,
};
use super::producer::{EngineFact, EngineFailure, OutputItem, ProducerLine, ProducerOutput};

type Outcome = (RunStatus, Option<Failure>);

/// Terminal self-report of the engine, if it sent one.
#[derive(Default)]
struct Finished {
    failure: Option<EngineFailure>,
    normalized_path: Option<String>,
    seen: bool,
}

/// Supervises one run.
pub(crate) struct RunActor {
    pub run: Arc<Finalizer>,
    pub request: RunRequest,
    pub decision: BuildDecision,
    pub build_id: Option<BuildId>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub builder: Arc<dyn BuildExecutor>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub output_capacity: usize,
    pub run_dir: PathBuf,
}

impl RunActor {
    /// Runs to a terminal state and emits the completion event.
    pub async fn run(self, token: CancellationToken) {
        let guard = FinalizeGuard::new(Arc::clone(&self.run));
        let (status, failure) = self.supervise(&token).await;
        self.run.finalize(status, failure).await;
        guard.disarm();
    }

    async fn supervise(&self, token: &CancellationToken) -> Outcome {
        let _permit = match &self.semaphore {
            Some(sem) => {
                let permit = sem.clone().acquire_owned();
                tokio::pin!(permit);
                tokio::select! {
                    res = &mut permit => match res {
                        Ok(p) => Some(p),
                        Err(_closed) => return self.cancelled(),
                    },
                    _ = token.cancelled() => return self.cancelled(),
                }
            }
            None => None,
        };
        if token.is_cancelled() {
            return self.cancelled();
        }

        let drive = AssertUnwindSafe(self.drive(token)).catch_unwind();
        tokio::select! {
            res = drive => match res {
                // The engine may observe cancellation first and return an error.
                Ok(_) if token.is_cancelled() => self.cancelled(),
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(run_id = %self.run.run_id(), panic = %message, "run actor panicked");
                    (
                        RunStatus::Failed,
                        Some(Failure::new(FailureStage::Orchestration, "panic", message)),
                    )
                }
            },
            _ = token.cancelled() => self.cancelled(),
        }
    }

    fn cancelled(&self) -> Outcome {
        let stage = match self.run.status() {
            RunStatus::Building => FailureStage::Build,
            RunStatus::Running => FailureStage::Execution,
            _ => FailureStage::Orchestration,
        };
        (
            RunStatus::Cancelled,
            Some(Failure::new(stage, "cancelled", "run cancelled")),
        )
    }

    async fn drive(&self, token: &CancellationToken) -> Outcome {
        match self.decision.kind {
            BuildDecisionKind::Rebuild => {
                if let Err(failure) = self.build(token).await {
                    return (RunStatus::Failed, Some(failure));
                }
            }
            BuildDecisionKind::Reuse => self.reuse().await,
            BuildDecisionKind::Skip => {}
        }

        if let Err(e) = self.run.advance(RunStatus::Running).await {
            return (
                RunStatus::Failed,
                Some(Failure::new(
                    FailureStage::Orchestration,
                    e.as_label(),
                    e.to_string(),
                )),
            );
        }
        self.run
            .emit(
                EventSource::Orchestrator,
                None,
                &RunStartedV1 {
                    mode: self.request.mode,
                    engine: self.engine.name().to_owned(),
                },
            )
            .await;

        self.execute(token).await
    }

    async fn build(&self, token: &CancellationToken) -> Result<(), Failure> {
        let Some(build_id) = self.build_id.clone() else {
            return Err(Failure::new(
                FailureStage::Orchestration,
                "missing_build_id",
                "rebuild decided without a build id",
            ));
        };
        self.run
            .advance(RunStatus::Building)
            .await
            .map_err(|e| Failure::new(FailureStage::Orchestration, e.as_label(), e.to_string()))?;

        let reason = self.decision.reason.unwrap_or(BuildReason::CacheMiss);
        self.run.start_build(build_id.clone(), reason).await;

        let ctx = BuildContext {
            run_id: self.run.run_id().clone(),
            build_id: build_id.clone(),
            configuration_id: self.request.configuration_id.clone(),
            fingerprint: self.request.options.environment_fingerprint.clone(),
            workdir: self.run_dir.join("build"),
        };

        for phase in BuildPhase::ALL {
            self.run
                .emit(
                    EventSource::BuildStep,
                    Some(&build_id),
                    &BuildPhaseStartedV1 { phase },
                )
                .await;
            let started = Instant::now();
            let (output, rx) = ProducerOutput::channel(self.output_capacity);
            let mut finished = Finished::default();
            let res = self
                .pump(
                    self.builder
                        .run_phase(&ctx, phase, output, token.child_token()),
                    rx,
                    Some(&build_id),
                    &mut finished,
                )
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match res {
                Ok(()) => {
                    self.run
                        .emit(
                            EventSource::BuildStep,
                            Some(&build_id),
                            &BuildPhaseCompletedV1 {
                                phase,
                                status: PhaseStatus::Succeeded,
                                duration_ms,
                                message: None,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %self.run.run_id(),
                        phase = phase.as_str(),
                        error = %e,
                        "build phase failed"
                    );
                    self.run
                        .emit(
                            EventSource::BuildStep,
                            Some(&build_id),
                            &BuildPhaseCompletedV1 {
                                phase,
                                status: PhaseStatus::Failed,
                                duration_ms,
                                message: Some(e.to_string()),
                            },
                        )
                        .await;
                    self.run
                        .finish_build(BuildStatus::Failed, Some(e.to_string()))
                        .await;
                    return Err(Failure::new(FailureStage::Build, e.as_label(), e.to_string()));
                }
            }
        }

        self.run.finish_build(BuildStatus::Succeeded, None).await;
        Ok(())
    }

    async fn reuse(&self) {
        let Some(build_id) = self.build_id.clone() else {
            return;
        };
        let reason = self.decision.reason.unwrap_or(BuildReason::CacheHit);
        self.run.start_build(build_id, reason).await;
        self.run.finish_build(BuildStatus::Reused, None).await;
    }

    async fn execute(&self, token: &CancellationToken) -> Outcome {
        let request = EngineRequest {
            run_id: self.run.run_id().clone(),
            workspace_id: self.request.workspace_id.clone(),
            configuration_id: self.request.configuration_id.clone(),
            mode: self.request.mode,
            build_id: self.build_id.clone(),
            inputs: self.request.options.inputs.clone(),
            output_dir: self.run_dir.join("output"),
        };
        if let Err(e) = tokio::fs::create_dir_all(&request.output_dir).await {
            tracing::warn!(
                run_id = %self.run.run_id(),
                path = %request.output_dir.display(),
                error = %e,
                "engine output directory unavailable"
            );
        }
        let (output, rx) = ProducerOutput::channel(self.output_capacity);
        let mut finished = Finished::default();
        let res = self
            .pump(
                self.engine.execute(request, output, token.child_token()),
                rx,
                None,
                &mut finished,
            )
            .await;

        let normalized = match &res {
            Ok(outcome) => outcome.normalized_path.clone(),
            Err(_) => None,
        }
        .or_else(|| finished.normalized_path.take().map(PathBuf::from));
        if let Some(path) = normalized {
            self.run.set_normalized_path(path);
        }

        match (res, finished.failure) {
            (Err(e), _) => (
                RunStatus::Failed,
                Some(Failure::new(FailureStage::Execution, e.as_label(), e.to_string())),
            ),
            (Ok(_), Some(f)) => (
                RunStatus::Failed,
                Some(Failure::new(FailureStage::Execution, f.code, f.message)),
            ),
            (Ok(_), None) => (RunStatus::Succeeded, None),
        }
    }

    /// Awaits `fut` while handling its output, then drains what is left.
    async fn pump<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
        mut rx: mpsc::Receiver<OutputItem>,
        build_id: Option<&BuildId>,
        finished: &mut Finished,
    ) -> Result<T, E> {
        tokio::pin!(fut);
        let mut open = true;
        let res = loop {
            tokio::select! {
                res = &mut fut => break res,
                item = rx.recv(), if open => match item {
                    Some(item) => self.handle(item, build_id, finished).await,
                    None => open = false,
                },
            }
        };

        rx.close();
        while let Some(item) = rx.recv().await {
            self.handle(item, build_id, finished).await;
        }
        res
    }

    async fn handle(&self, item: OutputItem, build_id: Option<&BuildId>, finished: &mut Finished) {
        let source = if build_id.is_some() {
            EventSource::BuildStep
        } else {
            EventSource::ExtractionEngine
        };

        match item.line {
            Ok(ProducerLine::Text(message)) => {
                self.run
                    .emit(
                        source,
                        build_id,
                        &ConsoleLineV1 {
                            stream: item.stream,
                            message,
                        },
                    )
                    .await;
            }
            Ok(ProducerLine::Fact(fact)) if build_id.is_none() => {
                self.apply(*fact, finished).await;
            }
            Ok(ProducerLine::Fact(fact)) => {
                tracing::debug!(run_id = %self.run.run_id(), fact = ?fact, "fact from build step ignored");
            }
            Err(bad) => {
                tracing::warn!(
                    run_id = %self.run.run_id(),
                    reason = %bad.reason,
                    "malformed producer line dropped"
                );
                self.run
                    .emit(
                        EventSource::Orchestrator,
                        None,
                        &RunWarningV1 {
                            code: "malformed_engine_output".into(),
                            message: bad.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn apply(&self, fact: EngineFact, finished: &mut Finished) {
        let src = EventSource::ExtractionEngine;
        match fact {
            EngineFact::PhaseStarted { phase } => {
                self.run
                    .emit(src, None, &EnginePhaseStartedV1 { phase })
                    .await;
            }
            EngineFact::PhaseCompleted { phase, duration_ms } => {
                self.run
                    .emit(src, None, &EnginePhaseCompletedV1 { phase, duration_ms })
                    .await;
            }
            EngineFact::FieldsDeclared { fields } => {
                self.run
                    .with_report(|b| b.declare_fields(fields.iter().cloned()));
                self.run
                    .emit(src, None, &EngineFieldsDeclaredV1 { fields })
                    .await;
            }
            EngineFact::TableCompleted { table } => {
                let workbook = table.workbook.clone();
                let sheet = table.sheet.clone();
                let sheet_index = table.sheet_index;
                if let Some(summary) = self.run.with_report(|b| b.add_table(table)) {
                    self.run
                        .emit(
                            src,
                            None,
                            &EngineTableSummarizedV1 {
                                workbook,
                                sheet,
                                sheet_index,
                                table: summary,
                            },
                        )
                        .await;
                }
            }
            EngineFact::SheetCompleted {
                workbook,
                sheet,
                sheet_index,
            } => {
                self.run
                    .with_report(|b| b.complete_sheet(&workbook, &sheet, sheet_index));
                self.run
                    .emit(
                        src,
                        None,
                        &EngineSheetCompletedV1 {
                            workbook,
                            sheet,
                            sheet_index,
                        },
                    )
                    .await;
            }
            EngineFact::WorkbookCompleted { workbook } => {
                self.run.with_report(|b| b.complete_workbook(&workbook));
                self.run
                    .emit(src, None, &EngineWorkbookCompletedV1 { workbook })
                    .await;
            }
            EngineFact::Finished {
                failure,
                normalized_path,
            } => {
                if finished.seen {
                    tracing::warn!(run_id = %self.run.run_id(), "engine reported finished twice; keeping the last report");
                }
                finished.seen = true;
                finished.failure = failure;
                finished.normalized_path = normalized_path;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "run actor panicked".to_owned()
    }
}
