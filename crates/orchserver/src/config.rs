use orchruntime::{
    ExecutionStore, FileExecutionStore, FileWorkflowStore, InMemoryExecutionStore,
    InMemoryWorkflowStore, LocalTaskQueue, Orchestrator, RuntimeConfig, TaskRegistry,
    WorkflowStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Server settings read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Definitions loaded at startup; saves and deletes write back to it
    pub workflow_dir: Option<PathBuf>,
    /// Execution history on disk; in memory when unset
    pub execution_store_dir: Option<PathBuf>,
    pub runtime: RuntimeConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            workflow_dir: std::env::var_os("WORKFLOW_DIR").map(PathBuf::from),
            execution_store_dir: std::env::var_os("EXECUTION_STORE_DIR").map(PathBuf::from),
            runtime: RuntimeConfig::from_env(),
        }
    }

    /// Wire the orchestrator with the built-in tasks and the configured stores
    pub fn build_orchestrator(&self) -> anyhow::Result<Orchestrator> {
        let mut registry = TaskRegistry::new();
        let queue = Arc::new(LocalTaskQueue::new());
        orchtasks::register_all(&mut registry, queue.as_ref())?;

        let workflows: Arc<dyn WorkflowStore> = match &self.workflow_dir {
            Some(dir) => {
                info!("Reading workflow definitions from {}", dir.display());
                Arc::new(FileWorkflowStore::open(dir)?)
            }
            None => Arc::new(InMemoryWorkflowStore::new()),
        };

        let executions: Arc<dyn ExecutionStore> = match &self.execution_store_dir {
            Some(dir) => {
                info!("Persisting executions under {}", dir.display());
                Arc::new(FileExecutionStore::new(dir)?)
            }
            None => Arc::new(InMemoryExecutionStore::new()),
        };

        Ok(Orchestrator::new(
            Arc::new(registry),
            queue,
            workflows,
            executions,
            self.runtime.clone(),
        ))
    }
}
