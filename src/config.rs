//! # Global runtime configuration.
//!
//! Provides [`Config`], the centralized settings for the run service, and
//! [`MappingConfig`], the thresholds used to classify column mappings.
//!
//! Config is used in three places:
//! 1. **Service creation**: `RunService::builder(config)`
//! 2. **Dispatcher**: subscriber queue capacity and log durability
//! 3. **Report builder**: mapping thresholds and candidate cap
//!
//! ## Sentinel values
//! - `max_concurrent_runs = 0` → unlimited (no global semaphore created)
//! - `max_page_size = 0` → clamped to 1
//!
//! Hosts can load it from their own config files: every field has a default
//! (`#[serde(default)]`).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Global configuration for the run service.
///
/// ## Field semantics
/// - `data_dir`: root of the per-run directories (`{data_dir}/runs/{run_id}/`)
/// - `subscriber_capacity`: bounded queue size of every live subscriber (min 1)
/// - `max_stream_resyncs`: how often one stream may resync after overflow
/// - `max_concurrent_runs`: run concurrency limit (`0` = unlimited)
/// - `grace`: maximum wait for active runs on shutdown
/// - `sync_log`: fsync the event log after every append
/// - `engine_output_capacity`: buffered producer lines between engine and orchestrator
/// - `max_page_size`: upper bound for bulk event pages
/// - `mapping`: column mapping classification thresholds
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for event logs and run records.
    pub data_dir: PathBuf,

    /// Capacity of each live subscriber queue.
    ///
    /// A subscriber that falls this far behind is disconnected; its stream
    /// resumes from the event log.
    pub subscriber_capacity: usize,

    /// Maximum number of log resyncs one stream performs before giving up
    /// with [`StreamError::Lagged`](crate::StreamError::Lagged).
    pub max_stream_resyncs: u32,

    /// Maximum number of runs executing concurrently.
    ///
    /// - `0` = unlimited (no semaphore)
    /// - `n > 0` = at most `n` runs build/execute simultaneously; others stay queued
    pub max_concurrent_runs: usize,

    /// Maximum time to wait for active runs during shutdown.
    #[serde(with = "duration_secs")]
    pub grace: Duration,

    /// Whether every log append is followed by `fsync`.
    pub sync_log: bool,

    /// Capacity of the engine output channel.
    pub engine_output_capacity: usize,

    /// Upper bound for a bulk event page.
    pub max_page_size: usize,

    /// Mapping classification thresholds.
    pub mapping: MappingConfig,
}

impl Config {
    /// Returns the run concurrency limit as an `Option`.
    ///
    /// - `None` → unlimited (no semaphore)
    /// - `Some(n)` → at most `n` concurrent runs
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent_runs == 0 {
            None
        } else {
            Some(self.max_concurrent_runs)
        }
    }

    /// Returns a subscriber capacity clamped to a minimum of 1.
    #[inline]
    pub fn subscriber_capacity_clamped(&self) -> usize {
        self.subscriber_capacity.max(1)
    }

    /// Clamps a requested page size into `1..=max_page_size`.
    #[inline]
    pub fn page_size(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_page_size.max(1))
    }

    /// Directory holding everything persisted for one run.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    /// Path of the event log of one run.
    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.ndjson")
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `data_dir = ./var`
    /// - `subscriber_capacity = 1024`
    /// - `max_stream_resyncs = 8`
    /// - `max_concurrent_runs = 0` (unlimited)
    /// - `grace = 30s`
    /// - `sync_log = true`
    /// - `engine_output_capacity = 256`
    /// - `max_page_size = 1000`
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("var"),
            subscriber_capacity: 1024,
            max_stream_resyncs: 8,
            max_concurrent_runs: 0,
            grace: Duration::from_secs(30),
            sync_log: true,
            engine_output_capacity: 256,
            max_page_size: 1000,
            mapping: MappingConfig::default(),
        }
    }
}

/// Thresholds for classifying a physical column's mapping outcome.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Minimum candidate score for a mapping to be considered at all.
    pub threshold: f64,
    /// Two best candidates closer than this are a tie.
    pub ambiguity_margin: f64,
    /// Cap on candidates kept in a decision.
    pub max_candidates: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            ambiguity_margin: 0.05,
            max_candidates: 3,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("grace must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_resolved() {
        let mut cfg = Config::default();
        assert_eq!(cfg.concurrency_limit(), None);
        cfg.max_concurrent_runs = 4;
        assert_eq!(cfg.concurrency_limit(), Some(4));

        cfg.subscriber_capacity = 0;
        assert_eq!(cfg.subscriber_capacity_clamped(), 1);

        cfg.max_page_size = 50;
        assert_eq!(cfg.page_size(0), 1);
        assert_eq!(cfg.page_size(500), 50);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"data_dir": "/tmp/x", "grace": 2.5, "mapping": {"threshold": 0.8}}"#)
                .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.grace, Duration::from_millis(2500));
        assert_eq!(cfg.mapping.threshold, 0.8);
        assert_eq!(cfg.mapping.max_candidates, 3);
        assert_eq!(cfg.subscriber_capacity, 1024);
    }

    #[test]
    fn paths_are_per_run() {
        let cfg = Config {
            data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        assert_eq!(
            cfg.events_path("R1"),
            PathBuf::from("/data/runs/R1/events.ndjson")
        );
    }
}
