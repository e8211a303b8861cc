use crate::ExecutionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Errors raised while running a single node. These are absorbed by the
/// retry/skip policy and never stop the scheduler loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid params for task '{task_type}': {}", .violations.join("; "))]
    Validation {
        task_type: String,
        violations: Vec<String>,
    },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Only handler failures and timeouts count against `retryCount`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Timeout { .. } | NodeError::ExecutionFailed(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Invalid task params schema for '{task_type}': {message}")]
    InvalidSchema { task_type: String, message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Execution {0} already exists")]
    Conflict(ExecutionId),

    #[error("Snapshot of execution {0} cannot change after creation")]
    SnapshotMismatch(ExecutionId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
