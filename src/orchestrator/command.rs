//! # Subprocess adapters.
//!
//! [`CommandEngine`] and [`CommandBuildExecutor`] run external programs with
//! `tokio::process` and stream their output line by line into a
//! [`ProducerOutput`].
//!
//! ```text
//! child.stdout ──► lines ──► output.line(stdout)   (classified: fact | text)
//! child.stderr ──► lines ──► output.text(stderr)
//! token.cancelled() ──► kill child
//! ```
//!
//! The engine receives its [`EngineRequest`] as one JSON document on stdin.
//! Children are killed when the adapter future is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, EngineError};

use super::engine::{BuildContext, BuildExecutor, EngineOutcome, EngineRequest, ExtractionEngine};
use super::model::{BuildPhase, ConsoleStream};
use super::producer::ProducerOutput;

enum Exit {
    Status(ExitStatus),
    Cancelled,
}

/// Spawns `cmd`, pumps both pipes into `output` and waits for exit.
async fn run_streaming(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    output: &ProducerOutput,
    classify_stdout: bool,
    token: &CancellationToken,
) -> std::io::Result<Exit> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().map(|p| {
        let out = output.clone();
        tokio::spawn(pump(p, out, ConsoleStream::Stdout, classify_stdout))
    });
    let stderr = child.stderr.take().map(|p| {
        let out = output.clone();
        tokio::spawn(pump(p, out, ConsoleStream::Stderr, false))
    });

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading its request is judged by its exit status.
        if let Err(e) = write_stdin(&mut pipe, &bytes).await {
            tracing::debug!(error = %e, "child stdin closed early");
        }
    }

    let exit = tokio::select! {
        status = child.wait() => Exit::Status(status?),
        _ = token.cancelled() => {
            child.start_kill()?;
            let _ = child.wait().await;
            Exit::Cancelled
        }
    };

    for handle in [stdout, stderr].into_iter().flatten() {
        let _ = handle.await;
    }
    Ok(exit)
}

async fn write_stdin(pipe: &mut tokio::process::ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    pipe.write_all(bytes).await?;
    pipe.shutdown().await
}

async fn pump<R>(pipe: R, output: ProducerOutput, stream: ConsoleStream, classify: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "producer pipe read failed");
                break;
            }
        };
        let delivered = if classify {
            output.line(stream, &line).await
        } else {
            output.text(stream, line).await
        };
        if !delivered {
            break;
        }
    }
}

/// Extraction engine backed by an external program.
#[derive(Clone, Debug)]
pub struct CommandEngine {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "engine".to_owned());
        Self {
            name,
            program,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl ExtractionEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: EngineRequest,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<EngineOutcome, EngineError> {
        let stdin = serde_json::to_vec(&request).map_err(|e| EngineError::Spawn {
            message: format!("encode request: {e}"),
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&request.output_dir);

        let exit = run_streaming(cmd, Some(stdin), &output, true, &token)
            .await
            .map_err(|e| EngineError::Spawn {
                message: e.to_string(),
            })?;

        match exit {
            Exit::Cancelled => Err(EngineError::Crashed {
                message: "killed on cancellation".to_owned(),
            }),
            Exit::Status(s) if s.success() => Ok(EngineOutcome::default()),
            Exit::Status(s) => match s.code() {
                Some(code) => Err(EngineError::ExitCode { code }),
                None => Err(EngineError::Crashed {
                    message: format!("terminated abnormally ({s})"),
                }),
            },
        }
    }
}

/// Build executor running one command per phase.
///
/// A successful `verify` phase writes `{cache_dir}/{fingerprint}.ready`;
/// [`is_cached`](BuildExecutor::is_cached) checks for that marker.
#[derive(Clone, Debug)]
pub struct CommandBuildExecutor {
    cache_dir: PathBuf,
    phases: HashMap<BuildPhase, Vec<String>>,
}

impl CommandBuildExecutor {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            phases: HashMap::new(),
        }
    }

    /// Sets the argv of one phase. Phases without a command succeed trivially.
    pub fn phase<I, S>(mut self, phase: BuildPhase, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases
            .insert(phase, argv.into_iter().map(Into::into).collect());
        self
    }

    fn marker(&self, fingerprint: &str) -> PathBuf {
        let safe: String = fingerprint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{safe}.ready"))
    }
}

#[async_trait]
impl BuildExecutor for CommandBuildExecutor {
    async fn is_cached(&self, fingerprint: Option<&str>) -> bool {
        match fingerprint {
            Some(fp) => tokio::fs::try_exists(self.marker(fp)).await.unwrap_or(false),
            None => false,
        }
    }

    async fn run_phase(
        &self,
        ctx: &BuildContext,
        phase: BuildPhase,
        output: ProducerOutput,
        token: CancellationToken,
    ) -> Result<(), BuildError> {
        if let Some((program, args)) = self.phases.get(&phase).and_then(|a| a.split_first()) {
            tokio::fs::create_dir_all(&ctx.workdir)
                .await
                .map_err(|e| spawn_error(phase, e))?;

            let mut cmd = Command::new(program);
            cmd.args(args)
                .current_dir(&ctx.workdir)
                .env("RUNVISOR_RUN_ID", ctx.run_id.as_str())
                .env("RUNVISOR_BUILD_ID", ctx.build_id.as_str());

            let exit = run_streaming(cmd, None, &output, false, &token)
                .await
                .map_err(|e| spawn_error(phase, e))?;
            match exit {
                Exit::Status(s) if s.success() => {}
                Exit::Status(s) => {
                    return Err(BuildError::PhaseFailed {
                        phase: phase.as_str().to_owned(),
                        message: format!("command exited with {s}"),
                    });
                }
                Exit::Cancelled => {
                    return Err(BuildError::PhaseFailed {
                        phase: phase.as_str().to_owned(),
                        message: "cancelled".to_owned(),
                    });
                }
            }
        }

        if phase == BuildPhase::Verify {
            if let Some(fp) = ctx.fingerprint.as_deref() {
                write_marker(&self.marker(fp))
                    .await
                    .map_err(|e| spawn_error(phase, e))?;
            }
        }
        Ok(())
    }
}

async fn write_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"").await
}

fn spawn_error(phase: BuildPhase, e: std::io::Error) -> BuildError {
    BuildError::Spawn {
        phase: phase.as_str().to_owned(),
        message: e.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ids::{BuildId, RunId};
    use crate::orchestrator::producer::{EngineFact, ProducerLine};
    use crate::orchestrator::RunMode;

    fn request(dir: &Path) -> EngineRequest {
        EngineRequest {
            run_id: RunId::from("r"),
            workspace_id: "w".into(),
            configuration_id: "c".into(),
            mode: RunMode::Execute,
            build_id: None,
            inputs: Default::default(),
            output_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn engine_output_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CommandEngine::new("/bin/sh").arg("-c").arg(
            r#"cat >/dev/null; echo 'hello'; echo '{"fact":"phase_started","phase":"detect"}'; echo '{"fact":' ; echo oops >&2"#,
        );
        let (out, mut rx) = ProducerOutput::channel(16);
        engine
            .execute(request(dir.path()), out, CancellationToken::new())
            .await
            .unwrap();

        let mut items = Vec::new();
        while let Some(i) = rx.recv().await {
            items.push(i);
        }
        let stdout: Vec<_> = items
            .iter()
            .filter(|i| i.stream == ConsoleStream::Stdout)
            .collect();
        assert_eq!(stdout.len(), 3);
        assert!(matches!(stdout[0].line, Ok(ProducerLine::Text(ref t)) if t == "hello"));
        assert!(matches!(
            stdout[1].line,
            Ok(ProducerLine::Fact(ref f)) if matches!(**f, EngineFact::PhaseStarted { .. })
        ));
        assert!(stdout[2].line.is_err());
        assert!(items.iter().any(|i| i.stream == ConsoleStream::Stderr));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CommandEngine::new("/bin/sh").arg("-c").arg("exit 3");
        let (out, _rx) = ProducerOutput::channel(4);
        let err = engine
            .execute(request(dir.path()), out, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExitCode { code: 3 }));
    }

    #[tokio::test]
    async fn build_marker_enables_cache() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandBuildExecutor::new(dir.path().join("cache"))
            .phase(BuildPhase::InstallDependencies, ["/bin/sh", "-c", "echo installing"]);
        let ctx = BuildContext {
            run_id: RunId::from("r"),
            build_id: BuildId::from("b"),
            configuration_id: "c".into(),
            fingerprint: Some("cfg/v1".into()),
            workdir: dir.path().join("work"),
        };

        assert!(!exec.is_cached(Some("cfg/v1")).await);
        for phase in BuildPhase::ALL {
            let (out, _rx) = ProducerOutput::channel(16);
            exec.run_phase(&ctx, phase, out, CancellationToken::new())
                .await
                .unwrap();
        }
        assert!(exec.is_cached(Some("cfg/v1")).await);
    }

    #[tokio::test]
    async fn failing_phase_is_phase_failed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandBuildExecutor::new(dir.path())
            .phase(BuildPhase::CreateEnvironment, ["/bin/sh", "-c", "exit 1"]);
        let ctx = BuildContext {
            run_id: RunId::from("r"),
            build_id: BuildId::from("b"),
            configuration_id: "c".into(),
            fingerprint: None,
            workdir: dir.path().to_path_buf(),
        };
        let (out, _rx) = ProducerOutput::channel(4);
        let err = exec
            .run_phase(&ctx, BuildPhase::CreateEnvironment, out, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "build_phase_failed");
    }
}
