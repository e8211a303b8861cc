//! Per-run mutable state: node results, node states and global variables.

use crate::{ExecutionId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of the latest attempt of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl NodeResult {
    pub fn success(output: Option<Value>, started_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn new(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Serialized form of an [`ExecutionContext`], stored as the checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub execution_id: ExecutionId,
    pub node_results: Vec<(NodeId, NodeResult)>,
    pub node_states: Vec<(NodeId, NodeState)>,
    pub global_vars: Vec<(String, Value)>,
}

/// Single source of truth for one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    node_results: HashMap<NodeId, NodeResult>,
    node_states: HashMap<NodeId, NodeState>,
    global_vars: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            node_results: HashMap::new(),
            node_states: HashMap::new(),
            global_vars: HashMap::new(),
        }
    }

    pub fn with_global_vars(execution_id: ExecutionId, global_vars: HashMap<String, Value>) -> Self {
        Self {
            global_vars,
            ..Self::new(execution_id)
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn set_node_result(&mut self, node_id: impl Into<String>, result: NodeResult) {
        self.node_results.insert(node_id.into(), result);
    }

    pub fn get_node_result(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.get(node_id)
    }

    pub fn remove_node_result(&mut self, node_id: &str) -> Option<NodeResult> {
        self.node_results.remove(node_id)
    }

    /// Output of a node, only if its latest result succeeded and carried one
    pub fn get_upstream_output(&self, node_id: &str) -> Option<&Value> {
        self.node_results
            .get(node_id)
            .filter(|r| r.success)
            .and_then(|r| r.output.as_ref())
    }

    pub fn is_node_completed(&self, node_id: &str) -> bool {
        self.node_results.contains_key(node_id)
    }

    pub fn is_node_success(&self, node_id: &str) -> bool {
        self.node_results.get(node_id).is_some_and(|r| r.success)
    }

    pub fn is_node_failed(&self, node_id: &str) -> bool {
        self.node_results.get(node_id).is_some_and(|r| !r.success)
    }

    pub fn set_node_state(&mut self, node_id: impl Into<String>, state: NodeState) {
        self.node_states.insert(node_id.into(), state);
    }

    pub fn get_node_state(&self, node_id: &str) -> Option<&NodeState> {
        self.node_states.get(node_id)
    }

    pub fn node_state_mut(&mut self, node_id: &str) -> Option<&mut NodeState> {
        self.node_states.get_mut(node_id)
    }

    /// Status of a node, `Pending` if it has no state yet
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_states
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::Pending)
    }

    /// Creates the state record on first use, otherwise only touches `status`
    pub fn update_node_status(&mut self, node_id: &str, status: NodeStatus) {
        self.node_states
            .entry(node_id.to_string())
            .and_modify(|s| s.status = status)
            .or_insert_with(|| NodeState::new(node_id, status));
    }

    pub fn get_all_node_states(&self) -> HashMap<NodeId, NodeState> {
        self.node_states.clone()
    }

    pub fn get_all_global_vars(&self) -> HashMap<String, Value> {
        self.global_vars.clone()
    }

    pub fn set_global_var(&mut self, name: impl Into<String>, value: Value) {
        self.global_vars.insert(name.into(), value);
    }

    pub fn get_global_var(&self, name: &str) -> Option<&Value> {
        self.global_vars.get(name)
    }

    pub fn has_global_var(&self, name: &str) -> bool {
        self.global_vars.contains_key(name)
    }

    pub fn delete_global_var(&mut self, name: &str) -> Option<Value> {
        self.global_vars.remove(name)
    }

    /// Empties all three maps; the execution id is kept
    pub fn clear(&mut self) {
        self.node_results.clear();
        self.node_states.clear();
        self.global_vars.clear();
    }

    /// Prepare a restored context for another pass of the scheduler. Nodes
    /// that succeeded or were skipped stay terminal; every other node goes
    /// back to `pending` and loses its previous result.
    pub fn reset_for_resume(&mut self) {
        for state in self.node_states.values_mut() {
            if matches!(state.status, NodeStatus::Success | NodeStatus::Skipped) {
                continue;
            }
            state.status = NodeStatus::Pending;
            state.error = None;
            state.started_at = None;
            state.completed_at = None;
            self.node_results.remove(&state.node_id);
        }
    }

    /// Carry this context over to a new execution id
    pub fn rebind(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = execution_id;
        self
    }

    pub fn to_snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            execution_id: self.execution_id,
            node_results: self
                .node_results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            node_states: self
                .node_states
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            global_vars: self
                .global_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id,
            node_results: snapshot.node_results.into_iter().collect(),
            node_states: snapshot.node_states.into_iter().collect(),
            global_vars: snapshot.global_vars.into_iter().collect(),
        }
    }
}
