#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use runvisor::error::{BuildError, EngineError, StoreError};
use runvisor::orchestrator::{ConsoleStream, RunRecord};
use runvisor::report::{Candidate, ColumnFacts, Region, RowSpan, TableFacts};
use runvisor::store::{MemoryRunStore, RecordUpdate, RunStore};
use runvisor::{
    BuildContext, BuildExecutor, BuildPhase, Config, EngineFact, EngineOutcome, EngineRequest,
    ExtractionEngine, ProducerOutput, RunId, RunService, RunStatus,
};

/// One scripted engine action.
#[derive(Clone)]
pub enum Step {
    Fact(EngineFact),
    Text(&'static str),
    Raw(&'static str),
    /// Waits until the gate is opened.
    Gate(Arc<Notify>),
    /// Blocks until cancelled.
    Hang,
    Crash(&'static str),
    Panic,
}

pub struct ScriptedEngine {
    steps: Vec<Step>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl ExtractionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        _request: EngineRequest,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<EngineOutcome, EngineError> {
        for step in &self.steps {
            match step {
                Step::Fact(f) => {
                    output.fact(f.clone()).await;
                }
                Step::Text(t) => {
                    output.text(ConsoleStream::Stdout, *t).await;
                }
                Step::Raw(l) => {
                    output.line(ConsoleStream::Stdout, l).await;
                }
                Step::Gate(n) => n.notified().await,
                Step::Hang => {
                    token.cancelled().await;
                    return Err(EngineError::Crashed {
                        message: "cancelled".into(),
                    });
                }
                Step::Crash(m) => {
                    return Err(EngineError::Crashed {
                        message: (*m).to_owned(),
                    });
                }
                Step::Panic => panic!("engine exploded"),
            }
        }
        Ok(EngineOutcome::default())
    }
}

pub struct ScriptedBuild {
    pub cached: bool,
    pub fail_at: Option<BuildPhase>,
}

impl ScriptedBuild {
    pub fn fresh() -> Self {
        Self {
            cached: false,
            fail_at: None,
        }
    }
}

#[async_trait]
impl BuildExecutor for ScriptedBuild {
    async fn is_cached(&self, _fingerprint: Option<&str>) -> bool {
        self.cached
    }

    async fn run_phase(
        &self,
        _ctx: &BuildContext,
        phase: BuildPhase,
        output: ProducerOutput,
        _token: CancellationToken,
    ) -> Result<(), BuildError> {
        output
            .text(ConsoleStream::Stdout, format!("running {}", phase.as_str()))
            .await;
        if self.fail_at == Some(phase) {
            output
                .text(ConsoleStream::Stderr, "resolver failed")
                .await;
            return Err(BuildError::PhaseFailed {
                phase: phase.as_str().to_owned(),
                message: "resolver failed".into(),
            });
        }
        Ok(())
    }
}

/// Memory store whose terminal updates take `delay`.
pub struct SlowTerminalStore {
    inner: MemoryRunStore,
    delay: Duration,
}

impl SlowTerminalStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryRunStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl RunStore for SlowTerminalStore {
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn update(&self, run_id: &RunId, update: RecordUpdate) -> Result<RunRecord, StoreError> {
        let mut next = self.inner.get(run_id).await?;
        update(&mut next);
        if next.status.is_terminal() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.update(run_id, Box::new(move |rec| *rec = next)).await
    }

    async fn get(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        self.inner.get(run_id).await
    }
}

pub fn config(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        grace: Duration::from_secs(5),
        sync_log: false,
        ..Config::default()
    }
}

pub fn service(dir: &TempDir, steps: Vec<Step>, build: ScriptedBuild) -> RunService {
    service_with(config(dir), steps, build)
}

pub fn service_with(cfg: Config, steps: Vec<Step>, build: ScriptedBuild) -> RunService {
    RunService::builder(cfg, Arc::new(ScriptedEngine::new(steps)), Arc::new(build)).build()
}

/// A table with one header row, two data rows and one column mapped to `field`.
pub fn table(workbook: &str, sheet: &str, table_index: u32, field: &str) -> EngineFact {
    EngineFact::TableCompleted {
        table: TableFacts {
            workbook: workbook.into(),
            sheet: sheet.into(),
            sheet_index: 0,
            table_index,
            region: Region {
                first_row: 1,
                last_row: 3,
                first_column: 1,
                last_column: 1,
            },
            header: Some(RowSpan { start: 1, end: 1 }),
            data: Some(RowSpan { start: 2, end: 3 }),
            columns: vec![ColumnFacts {
                index: 0,
                header_raw: Some(field.to_uppercase()),
                header_normalized: Some(field.into()),
                non_empty_cells: 3,
                candidates: vec![Candidate {
                    field: field.into(),
                    score: 0.95,
                }],
                chosen: Some(field.into()),
                score: Some(0.95),
                method: Some("header".into()),
                passthrough: false,
            }],
            issues: Vec::new(),
        },
    }
}

pub fn fields(names: &[&str]) -> EngineFact {
    EngineFact::FieldsDeclared {
        fields: names.iter().map(|s| (*s).to_owned()).collect(),
    }
}

pub fn sheet_done(workbook: &str, sheet: &str) -> EngineFact {
    EngineFact::SheetCompleted {
        workbook: workbook.into(),
        sheet: sheet.into(),
        sheet_index: 0,
    }
}

pub fn workbook_done(workbook: &str) -> EngineFact {
    EngineFact::WorkbookCompleted {
        workbook: workbook.into(),
    }
}

pub fn finished_ok() -> EngineFact {
    EngineFact::Finished {
        failure: None,
        normalized_path: None,
    }
}

/// Polls the store until the run reaches `status` or is terminal.
pub async fn wait_for_status(svc: &RunService, run_id: &RunId, status: RunStatus) -> RunRecord {
    within(async {
        loop {
            let record = svc.get_run(run_id).await.expect("run exists");
            if record.status == status || record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}
