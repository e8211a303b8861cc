//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflow executions as DAGs, the
//! task registry and params resolver, the task queue seam, execution and
//! definition stores, per-execution event subscriptions and the
//! [`Orchestrator`] control plane that ties them together.

mod condition;
mod definitions;
mod executor;
mod graph;
mod http;
mod params;
mod queue;
mod registry;
mod runtime;
mod script;
mod store;
mod subscription;

pub use definitions::{FileWorkflowStore, InMemoryWorkflowStore, WorkflowStore};
pub use executor::{ExecutionEngine, ExecutionRun, RunOutcome};
pub use graph::WorkflowGraph;
pub use http::HttpRequester;
pub use params::TaskParamsResolver;
pub use queue::{ActiveJob, LocalTaskQueue, TaskQueue};
pub use registry::{RegisteredTask, TaskDefinition, TaskMetadata, TaskRegistry};
pub use runtime::{Orchestrator, RuntimeConfig};
pub use script::{run_script, ScriptOutcome, VarChanges};
pub use store::{ExecutionStore, FileExecutionStore, InMemoryExecutionStore};
pub use subscription::{terminal_event, EventBus, EventEmitter, Subscription};
