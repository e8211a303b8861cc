use async_trait::async_trait;
use orchcore::rpc::Page;
use orchcore::{ExecutionId, ExecutionSummary, StoreError, WorkflowExecution};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Persistence for execution records. Every write replaces the whole record.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record; fails if the id is taken
    async fn create(&self, record: &WorkflowExecution) -> Result<(), StoreError>;

    /// Replace an existing record. The stored snapshot must not change.
    async fn save(&self, record: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Newest first
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>, StoreError>;

    /// Newest first; `page` starts at 1
    async fn list_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ExecutionSummary>, StoreError>;
}

fn check_snapshot(
    existing: &WorkflowExecution,
    record: &WorkflowExecution,
) -> Result<(), StoreError> {
    if existing.snapshot != record.snapshot {
        return Err(StoreError::SnapshotMismatch(record.execution_id));
    }
    Ok(())
}

fn newest_first(mut summaries: Vec<ExecutionSummary>) -> Vec<ExecutionSummary> {
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries
}

fn paginate(summaries: Vec<ExecutionSummary>, page: usize, page_size: usize) -> Page<ExecutionSummary> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let total = summaries.len();
    let items = newest_first(summaries)
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .collect();
    Page {
        items,
        total,
        page,
        page_size,
    }
}

#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.execution_id) {
            return Err(StoreError::Conflict(record.execution_id));
        }
        records.insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn save(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.execution_id) {
            check_snapshot(existing, record)?;
        }
        records.insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.records.read().await.get(&execution_id).cloned())
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        let summaries = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .map(WorkflowExecution::summary)
            .collect();
        Ok(newest_first(summaries).into_iter().take(limit).collect())
    }

    async fn list_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ExecutionSummary>, StoreError> {
        let summaries = self
            .records
            .read()
            .await
            .values()
            .map(WorkflowExecution::summary)
            .collect();
        Ok(paginate(summaries, page, page_size))
    }
}

/// One JSON file per execution. Writes go to a temp file that is renamed
/// over the record, so a crash never leaves a half-written record behind.
pub struct FileExecutionStore {
    base_path: PathBuf,
    // Serializes writers so create/save checks see a stable directory
    write_lock: tokio::sync::Mutex<()>,
}

impl FileExecutionStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn record_path(&self, execution_id: ExecutionId) -> PathBuf {
        self.base_path.join(format!("{}.json", execution_id))
    }

    async fn read_record(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        let path = self.record_path(execution_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        let path = self.record_path(record.execution_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn all_summaries(&self) -> Result<Vec<ExecutionSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<WorkflowExecution>(&bytes) {
                Ok(record) => summaries.push(record.summary()),
                Err(e) => tracing::warn!("Skipping unreadable execution record {}: {}", path.display(), e),
            }
        }
        Ok(summaries)
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn create(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        let _lock = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.record_path(record.execution_id)).await? {
            return Err(StoreError::Conflict(record.execution_id));
        }
        self.write_record(record).await
    }

    async fn save(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        let _lock = self.write_lock.lock().await;
        if let Some(existing) = self.read_record(record.execution_id).await? {
            check_snapshot(&existing, record)?;
        }
        self.write_record(record).await
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        self.read_record(execution_id).await
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        let summaries = self
            .all_summaries()
            .await?
            .into_iter()
            .filter(|s| s.workflow_id == workflow_id)
            .collect();
        Ok(newest_first(summaries).into_iter().take(limit).collect())
    }

    async fn list_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ExecutionSummary>, StoreError> {
        Ok(paginate(self.all_summaries().await?, page, page_size))
    }
}
