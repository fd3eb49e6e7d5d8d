//! Error types used by the runvisor runtime.
//!
//! One enum per concern:
//!
//! - [`SchemaError`]: payloads that do not match a registered `(type, version)`.
//! - [`LogError`]: event log I/O and decoding failures.
//! - [`DispatchError`]: rejected emissions.
//! - [`StreamError`]: replay/live transport failures.
//! - [`StoreError`]: run metadata persistence failures.
//! - [`EngineError`] / [`BuildError`]: failures reported by external collaborators.
//! - [`RunError`]: errors surfaced by [`RunService`](crate::RunService).
//!
//! All types provide `as_label` (stable snake_case for logs/metrics).

use std::time::Duration;

use thiserror::Error;

use crate::ids::RunId;
use crate::orchestrator::RunStatus;

/// # Payload validation failures.
///
/// Raised at the producer boundary. A schema error is a programming error in
/// the producer, never a transient fault; the emission is rejected and nothing
/// is persisted or broadcast.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No registration exists for this event type.
    #[error("unknown event type '{event_type}'")]
    UnknownType {
        /// The rejected type.
        event_type: String,
    },

    /// The type is known but not at this version.
    #[error("event type '{event_type}' has no schema version {version}")]
    UnknownVersion {
        /// The event type.
        event_type: String,
        /// The requested version.
        version: u32,
    },

    /// The payload does not match the registered shape.
    #[error("invalid payload for '{event_type}' v{version}: {reason}")]
    InvalidPayload {
        /// The event type.
        event_type: String,
        /// The schema version used for validation.
        version: u32,
        /// Decoder message (unknown field, missing field, wrong type...).
        reason: String,
    },

    /// Shipped `(type, version)` combinations are immutable.
    #[error("event type '{event_type}' v{version} is already registered")]
    AlreadyRegistered {
        /// The event type.
        event_type: String,
        /// The duplicated version.
        version: u32,
    },
}

impl SchemaError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SchemaError::UnknownType { .. } => "schema_unknown_type",
            SchemaError::UnknownVersion { .. } => "schema_unknown_version",
            SchemaError::InvalidPayload { .. } => "schema_invalid_payload",
            SchemaError::AlreadyRegistered { .. } => "schema_already_registered",
        }
    }
}

/// # Event log failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LogError {
    /// Underlying file I/O failed.
    #[error("event log i/o: {0}")]
    Io(#[from] std::io::Error),

    /// An envelope could not be encoded as a log line.
    #[error("event log encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// A persisted line is not a valid envelope.
    #[error("corrupt event log line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: u64,
        /// Decoder message.
        reason: String,
    },
}

impl LogError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LogError::Io(_) => "log_io",
            LogError::Encode(_) => "log_encode",
            LogError::Corrupt { .. } => "log_corrupt",
        }
    }
}

/// # Rejected emissions.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The payload failed registry validation.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The payload could not be converted to JSON.
    #[error("payload encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// No channel is open for this run.
    #[error("run {run_id} is not open for emission")]
    RunNotOpen {
        /// The run id.
        run_id: RunId,
    },

    /// The run already emitted its completion event and is sealed.
    #[error("run {run_id} already completed; emission of '{event_type}' rejected")]
    RunCompleted {
        /// The run id.
        run_id: RunId,
        /// Type that was attempted.
        event_type: String,
    },

    /// The emission task ended without reporting its envelope (runtime
    /// shutdown or a panic while appending).
    #[error("emission for run {run_id} interrupted: {message}")]
    Interrupted {
        /// The run id.
        run_id: RunId,
        /// Join failure detail.
        message: String,
    },
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Schema(e) => e.as_label(),
            DispatchError::Encode(_) => "dispatch_encode",
            DispatchError::RunNotOpen { .. } => "dispatch_run_not_open",
            DispatchError::RunCompleted { .. } => "dispatch_run_completed",
            DispatchError::Interrupted { .. } => "dispatch_interrupted",
        }
    }
}

/// # Streaming transport failures.
///
/// Stage failures of a run never show up here; they arrive as a well-formed
/// `run.completed` envelope. These are genuine transport problems.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StreamError {
    /// The event log could not be read.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The consumer fell behind too many times; reconnect with the cursor.
    #[error("stream lagged behind live events; resume after sequence {after_sequence}")]
    Lagged {
        /// Last sequence delivered to the consumer.
        after_sequence: u64,
    },

    /// The resume token could not be parsed.
    #[error("invalid resume token '{token}'")]
    InvalidCursor {
        /// The rejected token.
        token: String,
    },
}

impl StreamError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StreamError::Log(e) => e.as_label(),
            StreamError::Lagged { .. } => "stream_lagged",
            StreamError::InvalidCursor { .. } => "stream_invalid_cursor",
        }
    }
}

/// # Run metadata store failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The run does not exist.
    #[error("run {run_id} not found")]
    NotFound {
        /// The run id.
        run_id: RunId,
    },

    /// A run with this id already exists.
    #[error("run {run_id} already exists")]
    Duplicate {
        /// The run id.
        run_id: RunId,
    },

    /// Underlying file I/O failed.
    #[error("run store i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("run store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::Duplicate { .. } => "store_duplicate",
            StoreError::Io(_) => "store_io",
            StoreError::Encode(_) => "store_encode",
        }
    }
}

/// # Failures of the extraction engine.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The engine could not be started.
    #[error("engine failed to start: {message}")]
    Spawn {
        /// Launcher message.
        message: String,
    },

    /// The engine terminated abnormally (signal, crash, lost pipe).
    #[error("engine crashed: {message}")]
    Crashed {
        /// What is known about the crash.
        message: String,
    },

    /// The engine finished with a non-zero exit code.
    #[error("engine exited with code {code}")]
    ExitCode {
        /// Process exit code.
        code: i32,
    },

    /// The engine reported a failure of its own.
    #[error("engine reported failure [{code}]: {message}")]
    Reported {
        /// Engine failure code.
        code: String,
        /// Engine failure message.
        message: String,
    },
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// The label doubles as the `failure.code` of the completion event.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::Spawn { .. } => "engine_spawn_failed",
            EngineError::Crashed { .. } => "engine_crashed",
            EngineError::ExitCode { .. } => "engine_exit_nonzero",
            EngineError::Reported { .. } => "engine_reported_failure",
        }
    }
}

/// # Failures of a build phase.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    /// The phase ran and failed.
    #[error("build phase '{phase}' failed: {message}")]
    PhaseFailed {
        /// Phase name.
        phase: String,
        /// Failure message.
        message: String,
    },

    /// The phase could not be started.
    #[error("build phase '{phase}' could not start: {message}")]
    Spawn {
        /// Phase name.
        phase: String,
        /// Launcher message.
        message: String,
    },
}

impl BuildError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BuildError::PhaseFailed { .. } => "build_phase_failed",
            BuildError::Spawn { .. } => "build_spawn_failed",
        }
    }
}

/// # Errors surfaced by the run service.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunError {
    /// The run does not exist.
    #[error("run {run_id} not found")]
    NotFound {
        /// The run id.
        run_id: RunId,
    },

    /// The state machine forbids this transition.
    #[error("invalid run transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status.
        from: RunStatus,
        /// Requested status.
        to: RunStatus,
    },

    /// The service no longer accepts runs.
    #[error("run service is shutting down")]
    ShuttingDown,

    /// Shutdown grace period was exceeded; some runs did not finish in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck runs: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Runs still active when the grace period ran out.
        stuck: Vec<String>,
    },

    /// Metadata store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Emission failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Event log failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Streaming failure (e.g. bad resume token).
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl RunError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunError::NotFound { .. } => "run_not_found",
            RunError::InvalidTransition { .. } => "run_invalid_transition",
            RunError::ShuttingDown => "run_service_shutting_down",
            RunError::GraceExceeded { .. } => "run_grace_exceeded",
            RunError::Store(e) => e.as_label(),
            RunError::Dispatch(e) => e.as_label(),
            RunError::Log(e) => e.as_label(),
            RunError::Stream(e) => e.as_label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        let e = SchemaError::UnknownType {
            event_type: "nope".into(),
        };
        assert_eq!(e.as_label(), "schema_unknown_type");

        let d: DispatchError = e.into();
        assert_eq!(d.as_label(), "schema_unknown_type");

        let eng = EngineError::ExitCode { code: 137 };
        assert_eq!(eng.as_label(), "engine_exit_nonzero");
        assert_eq!(eng.to_string(), "engine exited with code 137");
    }

    #[test]
    fn grace_exceeded_lists_stuck_runs() {
        let err = RunError::GraceExceeded {
            grace: Duration::from_secs(1),
            stuck: vec!["r1".into()],
        };
        assert_eq!(err.as_label(), "run_grace_exceeded");
        assert!(err.to_string().contains("r1"));
    }
}
