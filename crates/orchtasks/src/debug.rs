use async_trait::async_trait;
use orchcore::{NodeError, TaskHandler, TaskInvocation};
use orchruntime::{TaskDefinition, TaskMetadata};
use serde_json::{json, Value};

/// Logs its params and echoes the message
pub struct DebugTask;

#[async_trait]
impl TaskHandler for DebugTask {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let message = invocation
            .param("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");

        tracing::info!(
            execution_id = %invocation.execution_id,
            node_id = %invocation.node_id,
            "DEBUG: {}",
            message
        );
        if let Some(params) = invocation.params.as_object() {
            for (key, value) in params {
                tracing::debug!("  {}: {}", key, value);
            }
        }

        Ok(json!({ "message": message }))
    }
}

pub struct DebugTaskDefinition;

impl TaskDefinition for DebugTaskDefinition {
    fn name(&self) -> &str {
        "debug.log"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"}
            }
        }))
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Logs its params for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
