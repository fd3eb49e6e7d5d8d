//! # Event envelope.
//!
//! Every event of a run travels in an [`Envelope`]. Identity fields
//! (`event_id`, `created_at`, `sequence`) are assigned by the
//! [`Dispatcher`](crate::Dispatcher) only; producers hand over a type, a
//! source and a payload.
//!
//! ## Wire form (one line of the event log)
//! ```text
//! {"type":"run.started","schema_version":1,"event_id":"01J…","created_at":"…",
//!  "sequence":4,"source":"orchestrator","run_id":"01J…","payload":{…}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{BuildId, RunId};

/// Type of the terminal event of every run.
pub const RUN_COMPLETED: &str = "run.completed";

/// Producer of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Orchestrator,
    ExtractionEngine,
    BuildStep,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Orchestrator => "orchestrator",
            EventSource::ExtractionEngine => "extraction-engine",
            EventSource::BuildStep => "build-step",
        }
    }
}

/// Immutable, fully identified event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub schema_version: u32,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    /// Per-run position, starting at 1, gapless.
    pub sequence: u64,
    pub source: EventSource,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<BuildId>,
    pub payload: Value,
}

impl Envelope {
    /// True for the terminal `run.completed` event.
    #[inline]
    pub fn is_completion(&self) -> bool {
        self.event_type == RUN_COMPLETED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            event_type: "run.started".into(),
            schema_version: 1,
            event_id: "01HZZZZZZZZZZZZZZZZZZZZZZZ".into(),
            created_at: Utc::now(),
            sequence: 3,
            source: EventSource::ExtractionEngine,
            run_id: RunId::from("run-1"),
            build_id: None,
            payload: serde_json::json!({"mode": "execute"}),
        }
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "run.started");
        assert_eq!(json["source"], "extraction-engine");
        assert!(json.get("build_id").is_none());
        assert!(json.get("event_type").is_none());
    }

    #[test]
    fn rejects_unknown_envelope_fields() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["extra"] = serde_json::json!(true);
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }
}
