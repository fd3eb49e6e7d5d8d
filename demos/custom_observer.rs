//! # Example: custom_observer
//!
//! Attaches a process-wide envelope observer and runs two pipelines, one of
//! which fails during the build.
//!
//! Shows how to:
//! - Implement the [`Subscribe`] trait.
//! - Wire observers through [`RunServiceBuilder::with_observers`](runvisor::orchestrator::RunServiceBuilder::with_observers).
//! - Read the outcome of a run from its record.
//!
//! ## Flow
//! ```text
//! Dispatcher::emit ──► log + live queues
//!        └─► SubscriberSet ──► TallyObserver.on_event()
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example custom_observer
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use runvisor::error::{BuildError, EngineError};
use runvisor::orchestrator::ConsoleStream;
use runvisor::{
    BuildContext, BuildExecutor, BuildPhase, Config, EngineFact, EngineOutcome, EngineRequest,
    Envelope, ExtractionEngine, ProducerOutput, RunRequest, RunService, Subscribe,
};

/// Counts envelopes per event type and prints terminal statuses.
#[derive(Default)]
struct TallyObserver {
    counts: Mutex<BTreeMap<String, u64>>,
}

#[async_trait]
impl Subscribe for TallyObserver {
    async fn on_event(&self, env: &Envelope) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(env.event_type.clone()).or_default() += 1;
        }
        if env.is_completion() {
            println!(
                "[tally] run {} finished: {}",
                env.run_id, env.payload["status"]
            );
        }
    }

    fn name(&self) -> &'static str {
        "tally"
    }
}

struct QuickEngine;

#[async_trait]
impl ExtractionEngine for QuickEngine {
    async fn execute(
        &self,
        _request: EngineRequest,
        output: ProducerOutput,
        _token: CancellationToken,
    ) -> Result<EngineOutcome, EngineError> {
        output.text(ConsoleStream::Stdout, "nothing to extract").await;
        output
            .fact(EngineFact::Finished {
                failure: None,
                normalized_path: None,
            })
            .await;
        Ok(EngineOutcome::default())
    }
}

/// Fails the dependency install for configurations named "broken".
struct PickyBuild;

#[async_trait]
impl BuildExecutor for PickyBuild {
    async fn is_cached(&self, _fingerprint: Option<&str>) -> bool {
        false
    }

    async fn run_phase(
        &self,
        ctx: &BuildContext,
        phase: BuildPhase,
        output: ProducerOutput,
        _token: CancellationToken,
    ) -> Result<(), BuildError> {
        if phase == BuildPhase::InstallDependencies && ctx.configuration_id == "broken" {
            output
                .text(ConsoleStream::Stderr, "no matching distribution found")
                .await;
            return Err(BuildError::PhaseFailed {
                phase: phase.as_str().to_owned(),
                message: "dependency resolution failed".into(),
            });
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = std::env::temp_dir().join(format!("runvisor-observer-{}", std::process::id()));
    let cfg = Config {
        data_dir: data_dir.clone(),
        sync_log: false,
        ..Config::default()
    };

    let tally = Arc::new(TallyObserver::default());
    let observer: Arc<dyn Subscribe> = tally.clone();
    let service = RunService::builder(cfg, Arc::new(QuickEngine), Arc::new(PickyBuild))
        .with_observers(vec![observer])
        .build();

    for configuration in ["good", "broken"] {
        let handle = service
            .create_run(RunRequest::new("demo-ws", configuration))
            .await?;
        let record = service.wait_for(&handle.run_id).await?;
        let stage = record.failure.as_ref().map(|f| f.stage);
        println!(
            "[main] {configuration}: status={} failure_stage={stage:?}",
            record.status.as_str()
        );
    }

    // Drains observer queues before printing the tally.
    service.shutdown().await?;
    if let Ok(counts) = tally.counts.lock() {
        for (event_type, n) in counts.iter() {
            println!("{event_type:<26} {n}");
        }
    }

    let _ = tokio::fs::remove_dir_all(&data_dir).await;
    Ok(())
}
