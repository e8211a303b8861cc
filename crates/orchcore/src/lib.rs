//! Core abstractions for the workflow orchestrator
//!
//! This crate provides the data model that all other components depend on:
//! workflow definitions, the per-run execution context, execution records,
//! subscription events, the task-handler seam and the error taxonomy.
//! It has no runtime machinery.

mod context;
mod error;
mod events;
mod execution;
pub mod rpc;
mod task;
mod workflow;

pub use context::{ContextSnapshot, ExecutionContext, NodeResult, NodeState, NodeStatus};
pub use error::{NodeError, OrchestratorError, StoreError, WorkflowError};
pub use events::{ExecutionEvent, ExecutionEventType};
pub use execution::{ExecutionId, ExecutionStatus, ExecutionSummary, Progress, WorkflowExecution};
pub use task::{JobId, TaskHandler, TaskInvocation};
pub use workflow::{
    ConditionNodeData, ConditionType, FailurePolicy, HttpNodeData, MarkerNodeData, NodeData,
    NodeId, NodeType, Position, ScriptNodeData, TaskNodeData, Viewport, WorkflowDefinition,
    WorkflowEdge, WorkflowId, WorkflowNode, HANDLE_FALSE, HANDLE_TRUE,
};

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
