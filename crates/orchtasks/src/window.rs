//! Time window shared by every node of a run.
//!
//! The first `window.resolve` node of an execution derives the window from
//! `defaultWindowHours` in the task config and caches it in the global
//! variable `timeWindow`; later nodes of the same run reuse it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use orchcore::{ExecutionContext, NodeError, TaskHandler, TaskInvocation};
use orchruntime::{TaskDefinition, TaskMetadata};
use serde_json::{json, Map, Value};

pub const TIME_WINDOW_VAR: &str = "timeWindow";
const DEFAULT_WINDOW_HOURS: i64 = 24;

pub struct WindowResolveTask;

#[async_trait]
impl TaskHandler for WindowResolveTask {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let start = parse_instant(invocation.require_str("windowStart")?, "windowStart")?;
        let end = parse_instant(invocation.require_str("windowEnd")?, "windowEnd")?;
        if start >= end {
            return Err(NodeError::ExecutionFailed(format!(
                "window start {} is not before end {}",
                start, end
            )));
        }
        Ok(json!({
            "windowStart": start.to_rfc3339(),
            "windowEnd": end.to_rfc3339(),
            "hours": (end - start).num_hours(),
        }))
    }
}

fn parse_instant(raw: &str, field: &str) -> Result<DateTime<Utc>, NodeError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NodeError::ExecutionFailed(format!("invalid {} '{}': {}", field, raw, e)))
}

pub struct WindowResolveTaskDefinition;

impl TaskDefinition for WindowResolveTaskDefinition {
    fn name(&self) -> &str {
        "window.resolve"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["windowStart", "windowEnd"],
            "properties": {
                "windowStart": {"type": "string"},
                "windowEnd": {"type": "string"}
            }
        }))
    }

    fn generate_default_params(&self, context: &mut ExecutionContext, config: &Value) -> Map<String, Value> {
        if let Some(Value::Object(cached)) = context.get_global_var(TIME_WINDOW_VAR) {
            return cached.clone();
        }

        let hours = config
            .get("defaultWindowHours")
            .and_then(Value::as_i64)
            .filter(|h| *h > 0)
            .unwrap_or(DEFAULT_WINDOW_HOURS);
        let end = Utc::now();
        let start = end - Duration::hours(hours);

        let mut window = Map::new();
        window.insert("windowStart".to_string(), json!(start.to_rfc3339()));
        window.insert("windowEnd".to_string(), json!(end.to_rfc3339()));
        tracing::debug!("Derived a {}h time window for execution {}", hours, context.execution_id());
        context.set_global_var(TIME_WINDOW_VAR, Value::Object(window.clone()));
        window
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Resolve the time window shared by a run".to_string(),
            category: "time".to_string(),
        }
    }
}
