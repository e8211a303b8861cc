use async_trait::async_trait;
use orchcore::{OrchestratorError, StoreError, WorkflowDefinition, WorkflowError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Catalog of workflow definitions
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// All definitions, ordered by id
    async fn list(&self) -> Vec<WorkflowDefinition>;

    async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition>;

    /// Insert or replace by id
    async fn save(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// Returns the removed definition, if any
    async fn delete(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflows(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self {
            workflows: RwLock::new(
                definitions
                    .into_iter()
                    .map(|d| (d.id.clone(), d))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<WorkflowDefinition> =
            self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn delete(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.write().await.remove(workflow_id))
    }
}

/// Definitions backed by a directory of `*.json` files. Reads are served
/// from memory; saves and deletes write through to the directory.
pub struct FileWorkflowStore {
    dir: PathBuf,
    // Definition and the file it lives in, by id
    workflows: RwLock<HashMap<String, (WorkflowDefinition, PathBuf)>>,
}

impl FileWorkflowStore {
    /// Load every definition in `dir`, creating it if missing
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(StoreError::from)?;
        let workflows = read_workflow_dir(&dir)?
            .into_iter()
            .map(|(path, definition)| (definition.id.clone(), (definition, path)))
            .collect();
        Ok(Self {
            dir,
            workflows: RwLock::new(workflows),
        })
    }

    fn new_path(&self, workflow_id: &str) -> Result<PathBuf, StoreError> {
        let unsafe_id = workflow_id.is_empty()
            || workflow_id.contains(['/', '\\'])
            || workflow_id.contains("..");
        if unsafe_id {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("workflow id '{}' cannot be used as a file name", workflow_id),
            )));
        }
        Ok(self.dir.join(format!("{}.json", workflow_id)))
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<WorkflowDefinition> = self
            .workflows
            .read()
            .await
            .values()
            .map(|(definition, _)| definition.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(|(definition, _)| definition.clone())
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        let path = match workflows.get(&definition.id) {
            Some((_, path)) => path.clone(),
            None => self.new_path(&definition.id)?,
        };

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&definition)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!("Wrote workflow '{}' to {}", definition.id, path.display());

        workflows.insert(definition.id.clone(), (definition, path));
        Ok(())
    }

    async fn delete(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut workflows = self.workflows.write().await;
        let Some((_, path)) = workflows.get(workflow_id) else {
            return Ok(None);
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(workflows.remove(workflow_id).map(|(definition, _)| definition))
    }
}

/// Read every `*.json` workflow definition in `dir`. Each file is validated;
/// the first unreadable or invalid file aborts the load.
fn read_workflow_dir(dir: &Path) -> Result<Vec<(PathBuf, WorkflowDefinition)>, OrchestratorError> {
    let mut definitions = Vec::new();
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(StoreError::from)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension() == Some("json".as_ref()))
        .collect();
    paths.sort();

    for path in paths {
        let file = std::fs::File::open(&path).map_err(StoreError::from)?;
        let definition: WorkflowDefinition = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| WorkflowError::Invalid(format!("{}: {}", path.display(), e)))?;
        definition.validate()?;
        tracing::info!("Loaded workflow '{}' from {}", definition.id, path.display());
        definitions.push((path, definition));
    }

    Ok(definitions)
}
