use crate::{
    ContextSnapshot, ExecutionContext, NodeId, NodeState, NodeStatus, WorkflowDefinition,
    WorkflowId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
}

/// Read model for history lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Progress,
}

/// Full persisted record of one execution.
///
/// `snapshot` is the definition as it was at trigger time and never changes
/// afterwards; `context` is the checkpoint a resume starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub node_states: HashMap<NodeId, NodeState>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub snapshot: WorkflowDefinition,
    pub context: ContextSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<ExecutionId>,
}

impl WorkflowExecution {
    /// Initial record written before the first node is dispatched
    pub fn start(snapshot: WorkflowDefinition, context: &ExecutionContext) -> Self {
        Self {
            execution_id: context.execution_id(),
            workflow_id: snapshot.id.clone(),
            status: ExecutionStatus::Running,
            node_states: context.get_all_node_states(),
            started_at: Utc::now(),
            completed_at: None,
            snapshot,
            context: context.to_snapshot(),
            error: None,
            retry_of: None,
        }
    }

    /// Replace the node states and checkpoint with the context's current view
    pub fn checkpoint(&mut self, context: &ExecutionContext) {
        self.node_states = context.get_all_node_states();
        self.context = context.to_snapshot();
    }

    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.snapshot.nodes.len(),
            ..Progress::default()
        };
        for state in self.node_states.values() {
            match state.status {
                NodeStatus::Success | NodeStatus::Skipped => progress.completed += 1,
                NodeStatus::Failed => progress.failed += 1,
                NodeStatus::Running => progress.running += 1,
                NodeStatus::Pending | NodeStatus::Cancelled => {}
            }
        }
        progress
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowNode;

    #[test]
    fn test_progress_counts() {
        let mut wf = WorkflowDefinition::new("wf", "Progress");
        for id in ["start", "a", "b", "c", "end"] {
            wf.add_node(WorkflowNode::task(id, "debug.log"));
        }
        let mut ctx = ExecutionContext::new(Uuid::new_v4());
        ctx.update_node_status("start", NodeStatus::Success);
        ctx.update_node_status("a", NodeStatus::Skipped);
        ctx.update_node_status("b", NodeStatus::Failed);
        ctx.update_node_status("c", NodeStatus::Running);
        ctx.update_node_status("end", NodeStatus::Pending);

        let record = WorkflowExecution::start(wf, &ctx);
        assert_eq!(
            record.summary().progress,
            Progress {
                total: 5,
                completed: 2,
                failed: 1,
                running: 1
            }
        );
    }

    #[test]
    fn test_finish_sets_completion() {
        let wf = WorkflowDefinition::new("wf", "Finish");
        let ctx = ExecutionContext::new(Uuid::new_v4());
        let mut record = WorkflowExecution::start(wf, &ctx);
        assert!(record.completed_at.is_none());

        record.finish(ExecutionStatus::Failed, Some("disk full".to_string()));
        assert!(record.completed_at.is_some());
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.summary().status, ExecutionStatus::Failed);
    }
}
