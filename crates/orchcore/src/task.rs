use crate::{ExecutionId, NodeError, NodeId};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

/// Work performed on behalf of a task node. The orchestrator never runs task
/// logic itself; it hands resolved params to a handler and records the outcome.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one invocation. Long-running handlers should watch
    /// `invocation.cancellation` and return [`NodeError::Cancelled`] early.
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError>;
}

/// One dispatch of a task node
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub task_type: String,
    /// Params after defaults, node overrides and schema validation
    pub params: Value,
    /// Cooperative abort signal for the whole execution
    pub cancellation: CancellationToken,
}

impl TaskInvocation {
    pub fn new(
        execution_id: ExecutionId,
        node_id: impl Into<String>,
        task_type: impl Into<String>,
        params: Value,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            task_type: task_type.into(),
            params,
            cancellation,
        }
    }

    /// Get a required string param or return error
    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        self.params
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::ExecutionFailed(format!("missing string param '{}'", name)))
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}
