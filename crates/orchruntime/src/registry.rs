use jsonschema::Validator;
use orchcore::{ExecutionContext, WorkflowError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog entry for a task type: how its params look and how defaults are
/// derived. How the task actually runs is the job of a [`orchcore::TaskHandler`].
pub trait TaskDefinition: Send + Sync {
    /// Task type identifier (e.g., "summarize", "time.delay")
    fn name(&self) -> &str;

    /// Optional: JSON Schema the resolved params must satisfy
    fn params_schema(&self) -> Option<Value> {
        None
    }

    /// Optional: derive default params. May read and cache values in the
    /// context's global variables so later nodes of the same run reuse them.
    fn generate_default_params(
        &self,
        _context: &mut ExecutionContext,
        _config: &Value,
    ) -> Map<String, Value> {
        Map::new()
    }

    /// Optional: description for catalogs
    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::default()
    }
}

/// Metadata about a task type
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub description: String,
    pub category: String,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// A task definition with its compiled params schema
pub struct RegisteredTask {
    definition: Arc<dyn TaskDefinition>,
    schema: Option<Value>,
    validator: Option<Validator>,
}

impl RegisteredTask {
    fn new(definition: Arc<dyn TaskDefinition>) -> Result<Self, WorkflowError> {
        let schema = definition.params_schema();
        let validator = schema
            .as_ref()
            .map(jsonschema::validator_for)
            .transpose()
            .map_err(|e| WorkflowError::InvalidSchema {
                task_type: definition.name().to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            definition,
            schema,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn params_schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub fn generate_default_params(
        &self,
        context: &mut ExecutionContext,
        config: &Value,
    ) -> Map<String, Value> {
        self.definition.generate_default_params(context, config)
    }

    /// Check params against the schema. Tasks without a schema accept anything.
    pub fn validate(&self, params: Value) -> Result<Value, Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(params);
        };

        let violations: Vec<String> = validator
            .iter_errors(&params)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() || path == "/" {
                    error.to_string()
                } else {
                    format!("at '{}': {}", path, error)
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(params)
        } else {
            Err(violations)
        }
    }

    pub fn metadata(&self) -> TaskMetadata {
        self.definition.metadata()
    }
}

/// Registry of available task types
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<RegisteredTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task definition; fails if its params schema does not compile
    pub fn register(&mut self, definition: Arc<dyn TaskDefinition>) -> Result<(), WorkflowError> {
        let task = RegisteredTask::new(definition)?;
        let name = task.name().to_string();
        tracing::info!("Registering task type: {}", name);
        self.tasks.insert(name, Arc::new(task));
        Ok(())
    }

    pub fn get_registered_task_by_name(&self, task_type: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.tasks.contains_key(task_type)
    }

    /// Get all registered task types, sorted
    pub fn list_task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_metadata(&self, task_type: &str) -> Option<TaskMetadata> {
        self.tasks.get(task_type).map(|t| t.metadata())
    }
}
