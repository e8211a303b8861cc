use orchcore::{ConditionNodeData, ConditionType, ExecutionContext, NodeError};
use serde_json::Value;

/// Decide which branch a condition node takes. `predecessors` are the
/// condition node's immediate upstream nodes.
pub fn evaluate(
    condition: &ConditionNodeData,
    predecessors: &[&str],
    context: &ExecutionContext,
) -> Result<bool, NodeError> {
    match condition.condition_type {
        ConditionType::PreviousNodeSuccess => Ok(!predecessors.is_empty()
            && predecessors.iter().all(|p| context.is_node_success(p))),
        ConditionType::PreviousNodeFailed => {
            Ok(predecessors.iter().any(|p| context.is_node_failed(p)))
        }
        ConditionType::KeyValueMatch => {
            let expression = condition.condition_expression.as_deref().ok_or_else(|| {
                NodeError::ExecutionFailed("keyValueMatch requires an expression".to_string())
            })?;
            let parsed = Expression::parse(expression)?;
            let actual = lookup(parsed.key, predecessors, context);
            Ok(parsed.matches(actual))
        }
    }
}

#[derive(Debug, PartialEq)]
enum Operator {
    Eq,
    Ne,
    Truthy,
}

#[derive(Debug)]
struct Expression<'a> {
    key: &'a str,
    operator: Operator,
    expected: Value,
}

impl<'a> Expression<'a> {
    /// Accepts `key == value`, `key = value`, `key != value` or a bare `key`
    fn parse(source: &'a str) -> Result<Self, NodeError> {
        let (key, operator, literal) = if let Some((key, literal)) = source.split_once("!=") {
            (key, Operator::Ne, Some(literal))
        } else if let Some((key, literal)) = source.split_once("==") {
            (key, Operator::Eq, Some(literal))
        } else if let Some((key, literal)) = source.split_once('=') {
            (key, Operator::Eq, Some(literal))
        } else {
            (source, Operator::Truthy, None)
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(NodeError::ExecutionFailed(format!(
                "invalid condition expression '{}'",
                source
            )));
        }

        let expected = literal
            .map(|raw| {
                let raw = raw.trim();
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            })
            .unwrap_or(Value::Null);

        Ok(Self {
            key,
            operator,
            expected,
        })
    }

    fn matches(&self, actual: Option<&Value>) -> bool {
        match self.operator {
            Operator::Truthy => actual.is_some_and(is_truthy),
            Operator::Eq => actual.is_some_and(|v| loosely_equal(v, &self.expected)),
            Operator::Ne => !actual.is_some_and(|v| loosely_equal(v, &self.expected)),
        }
    }
}

/// Resolve a dot path against upstream outputs first, then global variables
fn lookup<'c>(key: &str, predecessors: &[&str], context: &'c ExecutionContext) -> Option<&'c Value> {
    let mut segments = key.split('.');
    let head = segments.next()?;
    let rest: Vec<&str> = segments.collect();

    for predecessor in predecessors {
        if let Some(output) = context.get_upstream_output(predecessor) {
            if let Some(value) = walk(output.get(head), &rest) {
                return Some(value);
            }
        }
    }
    walk(context.get_global_var(head), &rest)
}

fn walk<'v>(root: Option<&'v Value>, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(root?, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        // `status == 200` against a string "200" and the other way around
        (Value::String(a), other) | (other, Value::String(a)) if !other.is_string() => {
            *a == other.to_string()
        }
        _ => actual == expected,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
