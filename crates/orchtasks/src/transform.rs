use async_trait::async_trait;
use orchcore::{NodeError, TaskHandler, TaskInvocation};
use orchruntime::{TaskDefinition, TaskMetadata};
use serde_json::{json, Value};

/// Parse a JSON string
pub struct JsonParseTask;

#[async_trait]
impl TaskHandler for JsonParseTask {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let text = invocation.require_str("json")?;
        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
        Ok(json!({ "parsed": parsed }))
    }
}

pub struct JsonParseTaskDefinition;

impl TaskDefinition for JsonParseTaskDefinition {
    fn name(&self) -> &str {
        "transform.json_parse"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["json"],
            "properties": {"json": {"type": "string"}}
        }))
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Render a value as a JSON string
pub struct JsonStringifyTask;

#[async_trait]
impl TaskHandler for JsonStringifyTask {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let value = invocation
            .param("value")
            .ok_or_else(|| NodeError::ExecutionFailed("missing param 'value'".to_string()))?;
        let pretty = invocation
            .param("pretty")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let rendered = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(json!({ "json": rendered }))
    }
}

pub struct JsonStringifyTaskDefinition;

impl TaskDefinition for JsonStringifyTaskDefinition {
    fn name(&self) -> &str {
        "transform.json_stringify"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["value"],
            "properties": {"pretty": {"type": "boolean"}}
        }))
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}
