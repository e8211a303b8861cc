use async_trait::async_trait;
use orchcore::{ExecutionContext, NodeError, TaskHandler, TaskInvocation};
use orchruntime::{TaskDefinition, TaskMetadata};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Duration};

/// Waits for `delayMs`, returning early if the execution is cancelled
pub struct DelayTask;

#[async_trait]
impl TaskHandler for DelayTask {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let delay_ms = invocation
            .param("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(1000);

        tracing::debug!("Delaying node {} for {}ms", invocation.node_id, delay_ms);

        tokio::select! {
            _ = invocation.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(json!({ "delayedMs": delay_ms })),
        }
    }
}

pub struct DelayTaskDefinition;

impl TaskDefinition for DelayTaskDefinition {
    fn name(&self) -> &str {
        "time.delay"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["delayMs"],
            "properties": {
                "delayMs": {"type": "integer", "minimum": 0}
            }
        }))
    }

    fn generate_default_params(&self, _context: &mut ExecutionContext, _config: &Value) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("delayMs".to_string(), json!(1000));
        defaults
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Delay execution for the given milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
