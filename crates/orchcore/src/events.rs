use crate::{ExecutionId, NodeId, NodeState, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionEventType {
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeCancelled,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

impl ExecutionEventType {
    /// The last event a subscriber sees for an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEventType::ExecutionCompleted
                | ExecutionEventType::ExecutionFailed
                | ExecutionEventType::ExecutionCancelled
        )
    }
}

/// Update pushed to subscribers of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_state: Option<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Event describing a node entering `state.status`
    pub fn node(execution_id: ExecutionId, state: &NodeState) -> Self {
        let event_type = match state.status {
            NodeStatus::Pending | NodeStatus::Running => ExecutionEventType::NodeStarted,
            NodeStatus::Success => ExecutionEventType::NodeCompleted,
            NodeStatus::Failed => ExecutionEventType::NodeFailed,
            NodeStatus::Skipped => ExecutionEventType::NodeSkipped,
            NodeStatus::Cancelled => ExecutionEventType::NodeCancelled,
        };
        Self {
            event_type,
            execution_id,
            node_id: Some(state.node_id.clone()),
            node_state: Some(state.clone()),
            error: state.error.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn execution(
        event_type: ExecutionEventType,
        execution_id: ExecutionId,
        error: Option<String>,
    ) -> Self {
        Self {
            event_type,
            execution_id,
            node_id: None,
            node_state: None,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
