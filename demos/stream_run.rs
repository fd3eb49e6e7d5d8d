//! # Example: stream_run
//!
//! Creates one run with an in-process engine and follows its event stream
//! live until `run.completed`, then fetches the stored report.
//!
//! Demonstrates how to:
//! - Implement [`ExtractionEngine`] and [`BuildExecutor`].
//! - Start a run with [`RunService::create_run`].
//! - Consume [`RunService::stream_events`] from the first event.
//!
//! ## Flow
//! ```text
//! create_run ──► run.queued
//!     ├─► build: build.started ──► build.phase.* ──► build.completed
//!     ├─► run.started
//!     ├─► engine lines ──► engine.* / console.line
//!     └─► run.completed (report)
//!
//! stream_events(Cursor::START) ──► replay ──► live ──► ends after run.completed
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example stream_run
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use runvisor::error::{BuildError, EngineError};
use runvisor::orchestrator::ConsoleStream;
use runvisor::report::{Candidate, ColumnFacts, Region, RowSpan, TableFacts};
use runvisor::{
    BuildContext, BuildExecutor, BuildPhase, Config, Cursor, EngineFact, EngineOutcome,
    EngineRequest, ExtractionEngine, ProducerOutput, RunReport, RunRequest, RunService,
};

/// Engine that reports one workbook with a single table.
struct DemoEngine;

#[async_trait]
impl ExtractionEngine for DemoEngine {
    fn name(&self) -> &str {
        "demo"
    }

    async fn execute(
        &self,
        _request: EngineRequest,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<EngineOutcome, EngineError> {
        // Raw lines are classified the same way subprocess output is.
        output
            .line(ConsoleStream::Stdout, r#"{"fact":"fields_declared","fields":["name","email"]}"#)
            .await;
        output.text(ConsoleStream::Stdout, "reading people.xlsx").await;

        if token.is_cancelled() {
            return Err(EngineError::Crashed {
                message: "cancelled".into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        output
            .fact(EngineFact::TableCompleted {
                table: people_table(),
            })
            .await;
        output
            .line(
                ConsoleStream::Stdout,
                r#"{"fact":"sheet_completed","workbook":"people.xlsx","sheet":"People"}"#,
            )
            .await;
        output
            .line(ConsoleStream::Stdout, r#"{"fact":"workbook_completed","workbook":"people.xlsx"}"#)
            .await;
        output.line(ConsoleStream::Stdout, r#"{"fact":"finished"}"#).await;
        Ok(EngineOutcome::default())
    }
}

/// Build executor whose phases only print.
struct DemoBuild;

#[async_trait]
impl BuildExecutor for DemoBuild {
    async fn is_cached(&self, _fingerprint: Option<&str>) -> bool {
        false
    }

    async fn run_phase(
        &self,
        _ctx: &BuildContext,
        phase: BuildPhase,
        output: ProducerOutput,
        _token: CancellationToken,
    ) -> Result<(), BuildError> {
        output
            .text(ConsoleStream::Stdout, format!("{} ok", phase.as_str()))
            .await;
        Ok(())
    }
}

fn people_table() -> TableFacts {
    let column = |index: u32, header: &str, field: Option<&str>| ColumnFacts {
        index,
        header_raw: Some(header.to_owned()),
        header_normalized: Some(header.to_lowercase()),
        non_empty_cells: 4,
        candidates: field
            .map(|f| vec![Candidate { field: f.to_owned(), score: 0.92 }])
            .unwrap_or_default(),
        chosen: field.map(str::to_owned),
        score: field.map(|_| 0.92),
        method: field.map(|_| "header".to_owned()),
        passthrough: false,
    };

    TableFacts {
        workbook: "people.xlsx".into(),
        sheet: "People".into(),
        sheet_index: 0,
        table_index: 0,
        region: Region {
            first_row: 1,
            last_row: 4,
            first_column: 1,
            last_column: 2,
        },
        header: Some(RowSpan { start: 1, end: 1 }),
        data: Some(RowSpan { start: 2, end: 4 }),
        columns: vec![column(0, "Name", Some("name")), column(1, "Email", Some("email"))],
        issues: Vec::new(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    runvisor::logging::init("warn");

    // 1. Keep run directories out of the working tree.
    let data_dir = std::env::temp_dir().join(format!("runvisor-demo-{}", std::process::id()));
    let cfg = Config {
        data_dir: data_dir.clone(),
        ..Config::default()
    };

    // 2. Wire the service.
    let service = RunService::builder(cfg, Arc::new(DemoEngine), Arc::new(DemoBuild)).build();

    // 3. Start a run and follow it live.
    let handle = service.create_run(RunRequest::new("demo-ws", "demo-cfg")).await?;
    println!("run {} created ({})", handle.run_id, handle.status.as_str());

    let mut events = service.stream_events(&handle.run_id, Cursor::START).await?;
    while let Some(env) = events.next().await {
        let env = env?;
        println!("{:>3} {:<26} {}", env.sequence, env.event_type, env.payload);
    }

    // 4. The stored report is the one carried by run.completed.
    if let Some(raw) = service.get_report(&handle.run_id).await? {
        let report: RunReport = serde_json::from_str(raw.get())?;
        println!(
            "outcome={:?} tables={} fields mapped={}/{}",
            report.evaluation.outcome,
            report.table_count,
            report.counts.fields.mapped,
            report.counts.fields.expected,
        );
    }

    service.shutdown().await?;
    let _ = tokio::fs::remove_dir_all(&data_dir).await;
    Ok(())
}
