use crate::WorkflowError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

pub type WorkflowId = String;
pub type NodeId = String;

/// Handle values carried by the two outgoing edges of a condition node
pub const HANDLE_TRUE: &str = "true";
pub const HANDLE_FALSE: &str = "false";

/// Complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            viewport: None,
        }
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Connect two nodes with a plain edge
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.push_edge(source.into(), target.into(), None);
    }

    /// Connect a condition node's branch to a target
    pub fn connect_branch(
        &mut self,
        source: impl Into<String>,
        branch: bool,
        target: impl Into<String>,
    ) {
        let handle = if branch { HANDLE_TRUE } else { HANDLE_FALSE };
        self.push_edge(source.into(), target.into(), Some(handle.to_string()));
    }

    fn push_edge(&mut self, source: String, target: String, source_handle: Option<String>) {
        let id = match &source_handle {
            Some(handle) => format!("{}-{}-{}", source, handle, target),
            None => format!("{}-{}", source, target),
        };
        self.edges.push(WorkflowEdge {
            id,
            source,
            target,
            source_handle,
            label: None,
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|n| matches!(n.data, NodeData::Start(_)))
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Check the structural invariants a definition must satisfy before a run
    /// can start. Acyclicity is checked when the runtime builds its graph.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
        }

        let mut incoming: HashMap<&str, usize> = HashMap::new();
        let mut outgoing: HashMap<&str, Vec<&WorkflowEdge>> = HashMap::new();
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(WorkflowError::InvalidConnection(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
            *incoming.entry(edge.target.as_str()).or_default() += 1;
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
        }

        let starts: Vec<&WorkflowNode> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.data, NodeData::Start(_)))
            .collect();
        match starts.as_slice() {
            [start] => {
                if incoming.contains_key(start.id.as_str()) {
                    return Err(WorkflowError::Invalid(format!(
                        "start node '{}' has incoming edges",
                        start.id
                    )));
                }
            }
            [] => return Err(WorkflowError::Invalid("missing start node".to_string())),
            _ => {
                return Err(WorkflowError::Invalid(format!(
                    "expected exactly one start node, found {}",
                    starts.len()
                )))
            }
        }

        let has_terminal_end = self.nodes.iter().any(|n| {
            matches!(n.data, NodeData::End(_)) && !outgoing.contains_key(n.id.as_str())
        });
        if !has_terminal_end {
            return Err(WorkflowError::Invalid(
                "at least one end node without outgoing edges is required".to_string(),
            ));
        }

        for node in &self.nodes {
            let NodeData::Condition(condition) = &node.data else {
                continue;
            };
            let edges = outgoing.get(node.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let handles: Vec<Option<&str>> =
                edges.iter().map(|e| e.source_handle.as_deref()).collect();
            let valid = edges.len() == 2
                && handles.contains(&Some(HANDLE_TRUE))
                && handles.contains(&Some(HANDLE_FALSE));
            if !valid {
                return Err(WorkflowError::InvalidConnection(format!(
                    "condition node '{}' needs exactly one 'true' and one 'false' edge",
                    node.id
                )));
            }
            if condition.condition_type == ConditionType::KeyValueMatch
                && condition
                    .condition_expression
                    .as_deref()
                    .map_or(true, |e| e.trim().is_empty())
            {
                return Err(WorkflowError::Invalid(format!(
                    "condition node '{}' uses keyValueMatch without an expression",
                    node.id
                )));
            }
        }

        Ok(())
    }
}

/// Node in a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct WorkflowNode {
    pub id: NodeId,
    pub position: Position,
    pub data: NodeData,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            position: Position::default(),
            data,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeData::Start(MarkerNodeData::default()))
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeData::End(MarkerNodeData::default()))
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeData::Parallel(MarkerNodeData::default()))
    }

    pub fn task(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::new(id, NodeData::Task(TaskNodeData::new(task_type)))
    }

    pub fn condition(id: impl Into<String>, condition_type: ConditionType) -> Self {
        Self::new(
            id,
            NodeData::Condition(ConditionNodeData {
                label: None,
                condition_type,
                condition_expression: None,
            }),
        )
    }

    pub fn script(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeData::Script(ScriptNodeData {
                label: None,
                script_code: code.into(),
                policy: FailurePolicy::default(),
            }),
        )
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeData::Http(HttpNodeData {
                label: None,
                url: url.into(),
                method: default_method(),
                headers: HashMap::new(),
                body: None,
                policy: FailurePolicy::default(),
            }),
        )
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Set a static param on a task node; no-op for other node types
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let NodeData::Task(task) = &mut self.data {
            task.params.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        if let NodeData::Condition(condition) = &mut self.data {
            condition.condition_expression = Some(expression.into());
        }
        self
    }

    pub fn with_retry(mut self, retry_count: u32) -> Self {
        if let Some(policy) = self.data.policy_mut() {
            policy.retry_count = retry_count;
        }
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        if let Some(policy) = self.data.policy_mut() {
            policy.timeout_ms = timeout_ms;
        }
        self
    }

    pub fn skip_on_failure(mut self) -> Self {
        if let Some(policy) = self.data.policy_mut() {
            policy.skip_on_failure = true;
        }
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }

    /// Failure policy of executable nodes; markers and conditions use the default
    pub fn policy(&self) -> FailurePolicy {
        match &self.data {
            NodeData::Task(task) => task.policy(),
            NodeData::Script(script) => script.policy,
            NodeData::Http(http) => http.policy,
            _ => FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Start,
    End,
    Task,
    Condition,
    Parallel,
    Script,
    Http,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Task => "task",
            NodeType::Condition => "condition",
            NodeType::Parallel => "parallel",
            NodeType::Script => "script",
            NodeType::Http => "http",
        };
        f.write_str(name)
    }
}

/// Per-type node payload, selected by the node's `type`
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Start(MarkerNodeData),
    End(MarkerNodeData),
    Task(TaskNodeData),
    Condition(ConditionNodeData),
    Parallel(MarkerNodeData),
    Script(ScriptNodeData),
    Http(HttpNodeData),
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Start(_) => NodeType::Start,
            NodeData::End(_) => NodeType::End,
            NodeData::Task(_) => NodeType::Task,
            NodeData::Condition(_) => NodeType::Condition,
            NodeData::Parallel(_) => NodeType::Parallel,
            NodeData::Script(_) => NodeType::Script,
            NodeData::Http(_) => NodeType::Http,
        }
    }

    fn policy_mut(&mut self) -> Option<&mut FailurePolicy> {
        match self {
            NodeData::Task(task) => Some(&mut task.policy),
            NodeData::Script(script) => Some(&mut script.policy),
            NodeData::Http(http) => Some(&mut http.policy),
            _ => None,
        }
    }
}

/// Label-only payload of start, end and parallel nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Retry, timeout and skip settings shared by executable nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicy {
    #[serde(default)]
    pub retry_count: u32,
    /// 0 means unbounded
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub skip_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(flatten)]
    pub policy: FailurePolicy,
}

impl TaskNodeData {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            label: None,
            task_type: task_type.into(),
            params: Map::new(),
            policy: FailurePolicy::default(),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionType {
    PreviousNodeSuccess,
    PreviousNodeFailed,
    KeyValueMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub condition_type: ConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub script_code: String,
    #[serde(flatten)]
    pub policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub policy: FailurePolicy,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Wire shape of a node: `{id, type, position, data}` with `data` left
/// untyped until `type` is known
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawNode> for WorkflowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let data = if raw.data.is_null() {
            Value::Object(Map::new())
        } else {
            raw.data
        };
        let parsed = match raw.node_type {
            NodeType::Start => serde_json::from_value(data).map(NodeData::Start),
            NodeType::End => serde_json::from_value(data).map(NodeData::End),
            NodeType::Parallel => serde_json::from_value(data).map(NodeData::Parallel),
            NodeType::Task => serde_json::from_value(data).map(NodeData::Task),
            NodeType::Condition => serde_json::from_value(data).map(NodeData::Condition),
            NodeType::Script => serde_json::from_value(data).map(NodeData::Script),
            NodeType::Http => serde_json::from_value(data).map(NodeData::Http),
        };
        let data = parsed
            .map_err(|e| format!("invalid data for {} node '{}': {}", raw.node_type, raw.id, e))?;

        Ok(WorkflowNode {
            id: raw.id,
            position: raw.position,
            data,
        })
    }
}

impl From<WorkflowNode> for RawNode {
    fn from(node: WorkflowNode) -> Self {
        let node_type = node.node_type();
        let data = match node.data {
            NodeData::Start(d) | NodeData::End(d) | NodeData::Parallel(d) => serde_json::to_value(d),
            NodeData::Task(d) => serde_json::to_value(d),
            NodeData::Condition(d) => serde_json::to_value(d),
            NodeData::Script(d) => serde_json::to_value(d),
            NodeData::Http(d) => serde_json::to_value(d),
        };
        RawNode {
            id: node.id,
            node_type,
            position: node.position,
            // Plain structs with string keys always serialize
            data: data.unwrap_or(Value::Null),
        }
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub zoom: f32,
}
