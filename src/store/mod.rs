//! # Run metadata persistence.
//!
//! One [`RunRecord`] per run: status, timestamps, build, failure detail, the
//! event log pointer and (once terminal) the report blob. Events are never
//! stored here; they live in the run's event log.
//!
//! - [`MemoryRunStore`] keeps records in a map (tests, embedded hosts).
//! - [`FileRunStore`] writes `{data_dir}/runs/{run_id}/run.json` atomically
//!   (temp file + rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::ids::RunId;
use crate::orchestrator::RunRecord;

/// Mutation applied to a stored record.
pub type RecordUpdate = Box<dyn FnOnce(&mut RunRecord) + Send>;

/// Storage of run metadata rows.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Inserts a new record; fails on duplicate ids.
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError>;

    /// Applies `update` to a record and returns the new state.
    async fn update(&self, run_id: &RunId, update: RecordUpdate) -> Result<RunRecord, StoreError>;

    /// Fetches one record.
    async fn get(&self, run_id: &RunId) -> Result<RunRecord, StoreError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryRunStore {
    records: RwLock<HashMap<RunId, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.run_id) {
            return Err(StoreError::Duplicate {
                run_id: record.run_id,
            });
        }
        records.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn update(&self, run_id: &RunId, update: RecordUpdate) -> Result<RunRecord, StoreError> {
        let mut records = self.records.write().await;
        let rec = records.get_mut(run_id).ok_or_else(|| StoreError::NotFound {
            run_id: run_id.clone(),
        })?;
        update(rec);
        Ok(rec.clone())
    }

    async fn get(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        self.records
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
            })
    }
}

/// One `run.json` per run directory.
pub struct FileRunStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, run_id: &RunId) -> PathBuf {
        self.data_dir
            .join("runs")
            .join(run_id.as_str())
            .join("run.json")
    }

    async fn read(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        match tokio::fs::read(self.path(run_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                run_id: run_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.path(&record.run_id);
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &bytes).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, record: RunRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path(&record.run_id)).await? {
            return Err(StoreError::Duplicate {
                run_id: record.run_id,
            });
        }
        self.write(&record).await
    }

    async fn update(&self, run_id: &RunId, update: RecordUpdate) -> Result<RunRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rec = self.read(run_id).await?;
        update(&mut rec);
        self.write(&rec).await?;
        Ok(rec)
    }

    async fn get(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        self.read(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{RunRequest, RunStatus};
    use serde_json::value::RawValue;

    fn record(id: &str) -> RunRecord {
        RunRecord::queued(
            RunId::from(id),
            &RunRequest::new("w", "c"),
            PathBuf::from("events.ndjson"),
        )
    }

    async fn exercise(store: &dyn RunStore) {
        store.insert(record("a")).await.unwrap();
        assert!(matches!(
            store.insert(record("a")).await,
            Err(StoreError::Duplicate { .. })
        ));

        let updated = store
            .update(
                &RunId::from("a"),
                Box::new(|r| {
                    r.status = RunStatus::Succeeded;
                    r.report = RawValue::from_string(r#"{"x": 1}"#.to_owned()).ok();
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Succeeded);

        let a = store.get(&RunId::from("a")).await.unwrap();
        let b = store.get(&RunId::from("a")).await.unwrap();
        assert_eq!(a.report_json(), Some(r#"{"x": 1}"#));
        assert_eq!(a.report_json(), b.report_json());

        assert!(matches!(
            store.get(&RunId::from("missing")).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.update(&RunId::from("missing"), Box::new(|_| {})).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path());
        exercise(&store).await;
        assert!(dir.path().join("runs/a/run.json").exists());
        assert!(!dir.path().join("runs/a/run.json.tmp").exists());
    }
}
