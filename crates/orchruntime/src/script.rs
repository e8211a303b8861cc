//! Script nodes: Rhai snippets with read/write access to global variables.

use orchcore::NodeError;
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use std::collections::HashMap;

/// Result of a script run: its return value and the changes it made to `vars`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutcome {
    pub output: Value,
    pub changes: VarChanges,
}

/// Global variable changes to apply to the execution context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarChanges {
    pub set: HashMap<String, Value>,
    pub removed: Vec<String>,
}

impl VarChanges {
    fn diff(before: &HashMap<String, Value>, after: HashMap<String, Value>) -> Self {
        let removed = before
            .keys()
            .filter(|k| !after.contains_key(*k))
            .cloned()
            .collect();
        let set = after
            .into_iter()
            .filter(|(k, v)| before.get(k) != Some(v))
            .collect();
        Self { set, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }
}

/// Run `code` with `vars` bound to a copy of the global variables and `input`
/// bound to the upstream output. Blocking; call from `spawn_blocking`.
pub fn run_script(
    code: &str,
    vars: HashMap<String, Value>,
    input: Value,
    max_operations: u64,
) -> Result<ScriptOutcome, NodeError> {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.register_fn("to_json", |v: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(v)).unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        serde_json::from_str::<Value>(s)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });

    let vars_map: rhai::Map = vars
        .iter()
        .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v.clone())))
        .collect();

    let mut scope = Scope::new();
    scope.push("vars", vars_map);
    scope.push("input", json_to_dynamic(input));

    let result = engine
        .eval_with_scope::<Dynamic>(&mut scope, code)
        .map_err(|e| NodeError::ExecutionFailed(format!("script error: {}", e)))?;

    let after: HashMap<String, Value> = scope
        .get_value::<rhai::Map>("vars")
        .ok_or_else(|| {
            NodeError::ExecutionFailed("script replaced `vars` with a non-map value".to_string())
        })?
        .into_iter()
        .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
        .collect();

    Ok(ScriptOutcome {
        output: dynamic_to_json(result),
        changes: VarChanges::diff(&vars, after),
    })
}

/// Convert rhai::Dynamic to serde_json::Value
fn dynamic_to_json(v: Dynamic) -> Value {
    if v.is_unit() {
        Value::Null
    } else if v.is_bool() {
        Value::Bool(v.as_bool().unwrap_or(false))
    } else if v.is_int() {
        serde_json::json!(v.as_int().unwrap_or(0))
    } else if v.is_float() {
        serde_json::json!(v.as_float().unwrap_or(0.0))
    } else if v.is_string() {
        Value::String(v.into_string().unwrap_or_default())
    } else if v.is_array() {
        match v.into_array() {
            Ok(items) => Value::Array(items.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        }
    } else if v.is_map() {
        match v.try_cast::<rhai::Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        }
    } else {
        Value::String(v.to_string())
    }
}

/// Convert serde_json::Value to rhai::Dynamic
fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(items) => Dynamic::from(items.into_iter().map(json_to_dynamic).collect::<rhai::Array>()),
        Value::Object(obj) => {
            let map: rhai::Map = obj
                .into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect();
            Dynamic::from(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_script_reads_and_writes_vars() {
        let outcome = run_script(
            r#"
                vars.total = vars.count * 2;
                vars.label = "doubled";
                vars.total
            "#,
            vars(json!({"count": 21, "keep": true})),
            Value::Null,
            10_000,
        )
        .unwrap();

        assert_eq!(outcome.output, json!(42));
        assert_eq!(outcome.changes.set.get("total"), Some(&json!(42)));
        assert_eq!(outcome.changes.set.get("label"), Some(&json!("doubled")));
        assert!(!outcome.changes.set.contains_key("keep"));
        assert!(outcome.changes.removed.is_empty());
    }

    #[test]
    fn test_script_removes_vars() {
        let outcome = run_script(
            r#"vars.remove("stale"); ()"#,
            vars(json!({"stale": 1, "fresh": 2})),
            Value::Null,
            10_000,
        )
        .unwrap();
        assert_eq!(outcome.changes.removed, vec!["stale".to_string()]);
        assert_eq!(outcome.output, Value::Null);
    }

    #[test]
    fn test_script_sees_upstream_input() {
        let outcome = run_script(
            "input.messages.len()",
            HashMap::new(),
            json!({"messages": ["a", "b", "c"]}),
            10_000,
        )
        .unwrap();
        assert_eq!(outcome.output, json!(3));
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_script_errors_and_runaway_loops_fail() {
        let syntax = run_script("let x = ;", HashMap::new(), Value::Null, 10_000);
        assert!(matches!(syntax, Err(NodeError::ExecutionFailed(_))));

        let runaway = run_script("loop { }", HashMap::new(), Value::Null, 1_000);
        assert!(matches!(runaway, Err(NodeError::ExecutionFailed(_))));
    }
}
