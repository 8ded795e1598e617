//! Durable run records.
//!
//! The orchestrator needs four writes: create, status update, item append
//! and finalize. Writes for one run are serialized; separate runs do not
//! contend. Stores enforce the run state machine, so a terminal run rejects
//! further item results.

use crate::error::{StoreError, StoreResult};
use crate::run::{Run, RunItemResult, RunStatus, RunSummary};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new `pending` run and return its id.
    async fn create_run(&self, run: &Run) -> StoreResult<String>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> StoreResult<()>;

    /// Record one item result at its dataset position.
    async fn append_item_result(&self, run_id: &str, result: &RunItemResult) -> StoreResult<()>;

    /// Attach the summary to a run that has reached a terminal status.
    async fn finalize_run(&self, run_id: &str, summary: &RunSummary) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Run>;
}

/// A write a store accepted, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create { run_id: String },
    UpdateStatus { run_id: String, status: RunStatus },
    AppendItem { run_id: String, index: usize },
    Finalize { run_id: String },
}

impl StoreCall {
    pub fn run_id(&self) -> &str {
        match self {
            StoreCall::Create { run_id }
            | StoreCall::UpdateStatus { run_id, .. }
            | StoreCall::AppendItem { run_id, .. }
            | StoreCall::Finalize { run_id } => run_id,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, Run>,
    calls: Vec<StoreCall>,
}

/// Keeps runs in memory and records every accepted write.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted writes, oldest first.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn run_ids(&self) -> Vec<String> {
        self.state.lock().await.runs.keys().cloned().collect()
    }

    async fn with_run<F>(&self, run_id: &str, call: StoreCall, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Run) -> StoreResult<()> + Send,
    {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        apply(run)?;
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &Run) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        state.runs.insert(run.id.clone(), run.clone());
        state.calls.push(StoreCall::Create {
            run_id: run.id.clone(),
        });
        Ok(run.id.clone())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> StoreResult<()> {
        let call = StoreCall::UpdateStatus {
            run_id: run_id.to_string(),
            status,
        };
        self.with_run(run_id, call, |run| run.set_status(status))
            .await
    }

    async fn append_item_result(&self, run_id: &str, result: &RunItemResult) -> StoreResult<()> {
        let call = StoreCall::AppendItem {
            run_id: run_id.to_string(),
            index: result.index,
        };
        self.with_run(run_id, call, |run| run.record_item(result.clone()))
            .await
    }

    async fn finalize_run(&self, run_id: &str, summary: &RunSummary) -> StoreResult<()> {
        let call = StoreCall::Finalize {
            run_id: run_id.to_string(),
        };
        self.with_run(run_id, call, |run| run.record_summary(summary.clone()))
            .await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        self.state
            .lock()
            .await
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }
}

/// Writes one pretty-printed JSON snapshot per run, `<dir>/<run_id>.json`,
/// rewritten after every accepted write.
///
/// Snapshots are written to a temporary file and renamed into place. A run
/// stays in memory only until it is finalized; later reads come from disk.
pub struct JsonFileRunStore {
    dir: PathBuf,
    runs: Mutex<HashMap<String, Arc<Mutex<Run>>>>,
}

impl JsonFileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Live run, or its snapshot on disk once it has been evicted.
    async fn handle(&self, run_id: &str) -> StoreResult<Arc<Mutex<Run>>> {
        if let Some(handle) = self.runs.lock().await.get(run_id).cloned() {
            return Ok(handle);
        }
        Ok(Arc::new(Mutex::new(self.read(run_id).await?)))
    }

    async fn read(&self, run_id: &str) -> StoreResult<Run> {
        let path = self.path_for(run_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::RunNotFound(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, run: &Run) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(run)?;
        let path = self.path_for(&run.id);
        let partial = path.with_extension("json.tmp");
        tokio::fs::write(&partial, json).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!("Wrote run snapshot {}", path.display());
        Ok(())
    }

    /// Apply `apply` to an in-memory copy, persist it, then keep it.
    async fn update<F>(&self, run_id: &str, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Run) -> StoreResult<()> + Send,
    {
        let handle = self.handle(run_id).await?;
        let mut run = handle.lock().await;
        let mut next = run.clone();
        apply(&mut next)?;
        self.write(&next).await?;
        *run = next;
        Ok(())
    }
}

#[async_trait]
impl RunStore for JsonFileRunStore {
    async fn create_run(&self, run: &Run) -> StoreResult<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.write(run).await?;
        self.runs
            .lock()
            .await
            .insert(run.id.clone(), Arc::new(Mutex::new(run.clone())));
        Ok(run.id.clone())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> StoreResult<()> {
        self.update(run_id, |run| run.set_status(status)).await
    }

    async fn append_item_result(&self, run_id: &str, result: &RunItemResult) -> StoreResult<()> {
        self.update(run_id, |run| run.record_item(result.clone()))
            .await
    }

    async fn finalize_run(&self, run_id: &str, summary: &RunSummary) -> StoreResult<()> {
        self.update(run_id, |run| run.record_summary(summary.clone()))
            .await?;
        self.runs.lock().await.remove(run_id);
        Ok(())
    }

    /// Falls back to the snapshot on disk for finalized runs and runs
    /// written by another process.
    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        let handle = self.handle(run_id).await?;
        let run = handle.lock().await.clone();
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetItem;
    use crate::error::AgentError;
    use crate::orchestrator::RunConfig;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn new_run() -> Run {
        Run::new("support-faq", None, RunConfig::default())
    }

    #[tokio::test]
    async fn test_memory_store_records_calls() {
        let store = InMemoryRunStore::new();
        let run = new_run();
        let id = assert_ok!(store.create_run(&run).await);
        assert_eq!(id, run.id);

        let item = DatasetItem::single_turn("q");
        store.update_run_status(&id, RunStatus::Running).await.unwrap();
        store
            .append_item_result(&id, &RunItemResult::pending(0, &item))
            .await
            .unwrap();
        store.update_run_status(&id, RunStatus::Completed).await.unwrap();
        store
            .finalize_run(&id, &RunSummary::from_items(&[]))
            .await
            .unwrap();

        let calls = store.calls().await;
        assert_eq!(calls.len(), 5);
        assert!(matches!(calls[2], StoreCall::AppendItem { index: 0, .. }));
        assert!(matches!(calls[4], StoreCall::Finalize { .. }));
        assert!(calls.iter().all(|c| c.run_id() == id));

        let stored = store.get_run(&id).await.unwrap();
        assert!(stored.is_finalized());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_writes_after_terminal() {
        let store = InMemoryRunStore::new();
        let id = store.create_run(&new_run()).await.unwrap();
        store.update_run_status(&id, RunStatus::Cancelled).await.unwrap();

        let item = DatasetItem::single_turn("q");
        let err = store
            .append_item_result(&id, &RunItemResult::pending(0, &item))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal { .. }));

        // Rejected writes are not recorded
        assert_eq!(store.calls().await.len(), 2);

        assert!(matches!(
            store.update_run_status("missing", RunStatus::Running).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_json_store_writes_snapshots() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileRunStore::new(dir.path().join("runs"));
        let run = new_run();
        let id = store.create_run(&run).await.unwrap();

        let item = DatasetItem::single_turn("q").with_id("q-1");
        store.update_run_status(&id, RunStatus::Running).await.unwrap();
        store
            .append_item_result(
                &id,
                &RunItemResult::failed(0, &item, AgentError::timeout("60s").into(), 60_000),
            )
            .await
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path_for(&id)).unwrap()).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["items"][0]["item_id"], "q-1");
        assert_eq!(json["items"][0]["error"]["agent"]["kind"], "timeout");

        store.update_run_status(&id, RunStatus::Completed).await.unwrap();
        store
            .finalize_run(&id, &RunSummary::from_items(&[]))
            .await
            .unwrap();

        // A fresh store over the same directory reads the snapshot back
        let reopened = JsonFileRunStore::new(dir.path().join("runs"));
        let loaded = reopened.get_run(&id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.summary.is_some());
        assert!(matches!(
            reopened.get_run("nope").await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_json_store_keeps_state_on_rejected_write() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileRunStore::new(dir.path());
        let id = store.create_run(&new_run()).await.unwrap();

        assert_err!(store.update_run_status(&id, RunStatus::Completed).await);
        assert_eq!(store.get_run(&id).await.unwrap().status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_json_store_evicts_finalized_runs() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileRunStore::new(dir.path());
        let id = store.create_run(&new_run()).await.unwrap();
        store.update_run_status(&id, RunStatus::Running).await.unwrap();
        store.update_run_status(&id, RunStatus::Completed).await.unwrap();
        assert_ok!(store.finalize_run(&id, &RunSummary::from_items(&[])).await);

        assert!(store.runs.lock().await.is_empty());
        assert!(store.get_run(&id).await.unwrap().is_finalized());

        // The snapshot on disk still enforces the terminal state
        let item = DatasetItem::single_turn("q");
        let err = store
            .append_item_result(&id, &RunItemResult::pending(0, &item))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Terminal { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(leftovers, vec![format!("{}.json", id)]);
    }
}
