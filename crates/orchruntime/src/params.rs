use crate::registry::TaskRegistry;
use orchcore::{ExecutionContext, NodeError};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Builds the params a task node is dispatched with: generated defaults,
/// overridden by the node's static params, validated against the task schema.
#[derive(Clone)]
pub struct TaskParamsResolver {
    registry: Arc<TaskRegistry>,
    config: Arc<Value>,
}

impl TaskParamsResolver {
    pub fn new(registry: Arc<TaskRegistry>, config: Arc<Value>) -> Self {
        Self { registry, config }
    }

    pub fn resolve_params(
        &self,
        task_type: &str,
        node_params: &Map<String, Value>,
        context: &mut ExecutionContext,
    ) -> Result<Value, NodeError> {
        let task = self
            .registry
            .get_registered_task_by_name(task_type)
            .ok_or_else(|| NodeError::UnknownTaskType(task_type.to_string()))?;

        let mut merged = task.generate_default_params(context, &self.config);
        for (key, value) in node_params {
            merged.insert(key.clone(), value.clone());
        }
        let merged = Value::Object(merged);

        if task.params_schema().is_none() {
            tracing::debug!("Task type {} has no params schema; skipping validation", task_type);
            return Ok(merged);
        }

        task.validate(merged).map_err(|violations| NodeError::Validation {
            task_type: task_type.to_string(),
            violations,
        })
    }
}
