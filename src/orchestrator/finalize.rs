//! # Run state cell and single finalization.
//!
//! [`Finalizer`] owns everything about a run that must survive until its
//! completion event: the status, the in-flight build, the report builder and
//! the status watch channel.
//!
//! ```text
//! actor ──► advance(building|running) ──► store + watch
//!       └─► finalize(status, failure)
//!              ├─ done already? ──► warn, no-op
//!              ├─ close in-flight build (build.completed)
//!              ├─ builder.finalize() ──► RunReport
//!              ├─ emit run.completed (seals the run)
//!              ├─ store: status, failure, report bytes
//!              └─ close run channel, publish terminal status
//! ```
//!
//! ## Rules
//! - `finalize` does its work at most once per run; later calls only log.
//! - Once started, finalization runs to the end even if its caller is aborted.
//! - The stored report is the exact JSON of the emitted `report` field.
//! - [`FinalizeGuard`] finalizes a run whose actor future was dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::value::RawValue;
use tokio::sync::watch;

use crate::config::MappingConfig;
use crate::dispatch::Dispatcher;
use crate::error::RunError;
use crate::ids::{BuildId, RunId};
use crate::report::{ExecutionFacts, RunReport, RunReportBuilder};
use crate::schema::payloads::{BuildCompletedV1, BuildStartedV1, RunCompletedV1, RunOutputs};
use crate::schema::{Envelope, EventPayload, EventSource};
use crate::store::RunStore;

use super::model::{BuildReason, BuildStatus, Failure, FailureStage, RunStatus};

struct InFlightBuild {
    build_id: BuildId,
    started: Instant,
}

struct State {
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    normalized_path: Option<PathBuf>,
    build: Option<InFlightBuild>,
    report: Option<RunReportBuilder>,
}

/// Shared state of one run between its actor, its drop guard and the service.
pub(crate) struct Finalizer {
    run_id: RunId,
    events_path: PathBuf,
    mapping: MappingConfig,
    dispatcher: Dispatcher,
    store: Arc<dyn RunStore>,
    done: AtomicBool,
    state: Mutex<State>,
    status_tx: watch::Sender<RunStatus>,
}

impl Finalizer {
    pub(crate) fn new(
        run_id: RunId,
        events_path: PathBuf,
        mapping: MappingConfig,
        dispatcher: Dispatcher,
        store: Arc<dyn RunStore>,
    ) -> (Arc<Self>, watch::Receiver<RunStatus>) {
        let (status_tx, status_rx) = watch::channel(RunStatus::Queued);
        let report = RunReportBuilder::new(run_id.clone(), mapping);
        let me = Arc::new(Self {
            run_id,
            events_path,
            mapping,
            dispatcher,
            store,
            done: AtomicBool::new(false),
            state: Mutex::new(State {
                status: RunStatus::Queued,
                started_at: None,
                normalized_path: None,
                build: None,
                report: Some(report),
            }),
            status_tx,
        });
        (me, status_rx)
    }

    pub(crate) fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.state().status
    }

    /// Moves the run to a non-terminal status.
    pub(crate) async fn advance(&self, to: RunStatus) -> Result<(), RunError> {
        let started_at = {
            let mut st = self.state();
            if self.is_done() || !st.status.can_transition_to(to) {
                return Err(RunError::InvalidTransition {
                    from: st.status,
                    to,
                });
            }
            st.status = to;
            if to == RunStatus::Running {
                st.started_at = Some(Utc::now());
            }
            st.started_at
        };

        self.store
            .update(
                &self.run_id,
                Box::new(move |rec| {
                    rec.status = to;
                    rec.started_at = started_at;
                }),
            )
            .await?;
        self.status_tx.send_replace(to);
        tracing::debug!(run_id = %self.run_id, status = to.as_str(), "run advanced");
        Ok(())
    }

    /// Runs `f` against the report builder while the run is still open.
    pub(crate) fn with_report<R>(&self, f: impl FnOnce(&mut RunReportBuilder) -> R) -> Option<R> {
        self.state().report.as_mut().map(f)
    }

    pub(crate) fn set_normalized_path(&self, path: PathBuf) {
        self.state().normalized_path = Some(path);
    }

    /// Emits `payload`, logging instead of failing when the emission is rejected.
    pub(crate) async fn emit<P: EventPayload>(
        &self,
        source: EventSource,
        build_id: Option<&BuildId>,
        payload: &P,
    ) -> Option<Arc<Envelope>> {
        match self
            .dispatcher
            .emit(&self.run_id, source, build_id, payload)
            .await
        {
            Ok(env) => Some(env),
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    event_type = P::TYPE,
                    error = %e,
                    label = e.as_label(),
                    "emission rejected"
                );
                None
            }
        }
    }

    /// Marks a build as started and emits `build.started`.
    pub(crate) async fn start_build(&self, build_id: BuildId, reason: BuildReason) {
        self.state().build = Some(InFlightBuild {
            build_id: build_id.clone(),
            started: Instant::now(),
        });
        self.update_build(BuildStatus::Building, false).await;
        self.emit(
            EventSource::Orchestrator,
            Some(&build_id),
            &BuildStartedV1 { build_id: build_id.clone(), reason },
        )
        .await;
    }

    /// Closes the in-flight build (if any) with `build.completed`.
    pub(crate) async fn finish_build(&self, status: BuildStatus, message: Option<String>) {
        let Some(build) = self.state().build.take() else {
            return;
        };
        let duration_ms = build.started.elapsed().as_millis() as u64;
        self.update_build(status, true).await;
        self.emit(
            EventSource::Orchestrator,
            Some(&build.build_id),
            &BuildCompletedV1 {
                build_id: build.build_id.clone(),
                status,
                duration_ms,
                message,
            },
        )
        .await;
    }

    async fn update_build(&self, status: BuildStatus, completed: bool) {
        let now = Utc::now();
        let res = self
            .store
            .update(
                &self.run_id,
                Box::new(move |rec| {
                    if let Some(b) = rec.build.as_mut() {
                        b.status = status;
                        if completed {
                            b.completed_at = Some(now);
                        } else {
                            b.started_at = Some(now);
                        }
                    }
                }),
            )
            .await;
        if let Err(e) = res {
            tracing::warn!(run_id = %self.run_id, error = %e, "build record update failed");
        }
    }

    /// Terminates the run exactly once.
    ///
    /// The terminal work runs on its own task, so aborting or dropping the
    /// caller after the once-flag flipped still completes the run.
    pub(crate) async fn finalize(self: &Arc<Self>, status: RunStatus, failure: Option<Failure>) {
        if self.done.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                run_id = %self.run_id,
                status = status.as_str(),
                "duplicate finalization ignored"
            );
            return;
        }

        let me = Arc::clone(self);
        let task = tokio::spawn(async move { me.complete(status, failure).await });
        if let Err(e) = task.await {
            tracing::error!(run_id = %self.run_id, error = %e, "run finalization task failed");
        }
    }

    async fn complete(&self, status: RunStatus, failure: Option<Failure>) {
        let (status, failure) = self.checked_terminal(status, failure);

        let in_flight_build = self.state().build.is_some();
        if in_flight_build {
            let build_status = if status == RunStatus::Cancelled {
                BuildStatus::Cancelled
            } else {
                BuildStatus::Failed
            };
            let message = failure.as_ref().map(|f| f.message.clone());
            self.finish_build(build_status, message).await;
        }

        let (builder, started_at, normalized_path) = {
            let mut st = self.state();
            st.status = status;
            (st.report.take(), st.started_at, st.normalized_path.take())
        };
        let builder =
            builder.unwrap_or_else(|| RunReportBuilder::new(self.run_id.clone(), self.mapping));
        let report = builder.finalize(ExecutionFacts::now(status, started_at, failure.clone()));
        let completed_at = report.execution.completed_at;

        let outputs = RunOutputs {
            events_path: existing(&self.events_path).await,
            normalized_path: match &normalized_path {
                Some(p) => existing(p).await,
                None => None,
            },
        };
        let log_degraded = self
            .dispatcher
            .is_degraded(&self.run_id)
            .await
            .unwrap_or(true);

        let payload = RunCompletedV1 {
            status,
            failure: failure.clone(),
            execution: report.execution.clone(),
            outputs,
            log_degraded,
            report,
        };
        let emitted = self
            .emit(EventSource::Orchestrator, None, &payload)
            .await;
        let report_bytes = stored_report(emitted.as_deref(), &payload.report);
        let log_degraded = self
            .dispatcher
            .is_degraded(&self.run_id)
            .await
            .unwrap_or(log_degraded)
            || emitted.is_none();

        let res = self
            .store
            .update(
                &self.run_id,
                Box::new(move |rec| {
                    rec.status = status;
                    rec.completed_at = Some(completed_at);
                    rec.failure = failure;
                    rec.log_degraded = log_degraded;
                    rec.report = report_bytes;
                }),
            )
            .await;
        if let Err(e) = res {
            tracing::error!(run_id = %self.run_id, error = %e, "terminal run record update failed");
        }

        self.dispatcher.close_run(&self.run_id).await;
        self.status_tx.send_replace(status);
        tracing::info!(run_id = %self.run_id, status = status.as_str(), "run completed");
    }

    fn checked_terminal(
        &self,
        status: RunStatus,
        failure: Option<Failure>,
    ) -> (RunStatus, Option<Failure>) {
        let from = self.status();
        if status.is_terminal() && from.can_transition_to(status) {
            return (status, failure);
        }
        tracing::error!(
            run_id = %self.run_id,
            from = from.as_str(),
            to = status.as_str(),
            "invalid terminal transition; recording failure"
        );
        (
            RunStatus::Failed,
            Some(Failure::new(
                FailureStage::Orchestration,
                "invalid_transition",
                format!("cannot complete a {} run as {}", from.as_str(), status.as_str()),
            )),
        )
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn existing(path: &std::path::Path) -> Option<String> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Some(path.display().to_string()),
        _ => None,
    }
}

fn stored_report(emitted: Option<&Envelope>, report: &RunReport) -> Option<Box<RawValue>> {
    let raw = match emitted.and_then(|env| env.payload.get("report")) {
        Some(value) => serde_json::value::to_raw_value(value),
        None => serde_json::value::to_raw_value(report),
    };
    match raw {
        Ok(raw) => Some(raw),
        Err(e) => {
            tracing::error!(error = %e, "report could not be encoded");
            None
        }
    }
}

/// Finalizes the run as cancelled if dropped while armed.
pub(crate) struct FinalizeGuard {
    run: Option<Arc<Finalizer>>,
}

impl FinalizeGuard {
    pub(crate) fn new(run: Arc<Finalizer>) -> Self {
        Self { run: Some(run) }
    }

    pub(crate) fn disarm(mut self) {
        self.run = None;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        if run.is_done() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    run.finalize(
                        RunStatus::Cancelled,
                        Some(Failure::new(
                            FailureStage::Orchestration,
                            "cancelled",
                            "run task dropped before completion",
                        )),
                    )
                    .await;
                });
            }
            Err(_) => {
                tracing::error!(run_id = %run.run_id(), "run dropped outside a runtime; no completion emitted");
            }
        }
    }
}
