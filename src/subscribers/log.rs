//! # LogWriter: envelope tracer
//!
//! A minimal observer that renders every dispatched envelope as a `tracing`
//! event. Use it for demos and debugging.
//!
//! ## Example output
//! ```text
//! INFO run_id=01J… sequence=1 source=orchestrator event_type=run.queued envelope
//! INFO run_id=01J… sequence=2 source=build-step event_type=build.phase.started envelope
//! WARN run_id=01J… sequence=9 code=malformed_engine_output run warning
//! INFO run_id=01J… sequence=14 status=succeeded run completed
//! ```

use async_trait::async_trait;

use crate::schema::{Envelope, RUN_COMPLETED};
use crate::subscribers::Subscribe;

/// Envelope tracing observer.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Envelope) {
        match e.event_type.as_str() {
            "run.warning" => {
                tracing::warn!(
                    run_id = %e.run_id,
                    sequence = e.sequence,
                    code = e.payload["code"].as_str().unwrap_or("unknown"),
                    message = e.payload["message"].as_str().unwrap_or(""),
                    "run warning"
                );
            }
            RUN_COMPLETED => {
                tracing::info!(
                    run_id = %e.run_id,
                    sequence = e.sequence,
                    status = e.payload["status"].as_str().unwrap_or("unknown"),
                    "run completed"
                );
            }
            "console.line" => {
                tracing::debug!(
                    run_id = %e.run_id,
                    sequence = e.sequence,
                    source = e.source.as_str(),
                    line = e.payload["message"].as_str().unwrap_or(""),
                    "console"
                );
            }
            other => {
                tracing::info!(
                    run_id = %e.run_id,
                    sequence = e.sequence,
                    source = e.source.as_str(),
                    event_type = other,
                    "envelope"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }
}
