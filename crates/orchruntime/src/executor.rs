use crate::condition;
use crate::graph::WorkflowGraph;
use crate::http::HttpRequester;
use crate::params::TaskParamsResolver;
use crate::queue::TaskQueue;
use crate::script::{self, VarChanges};
use crate::store::ExecutionStore;
use crate::subscription::EventEmitter;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use orchcore::{
    ExecutionContext, ExecutionEvent, ExecutionStatus, FailurePolicy, NodeData, NodeError,
    NodeId, NodeResult, NodeStatus, StoreError, TaskInvocation, WorkflowEdge, WorkflowExecution,
    HANDLE_FALSE, HANDLE_TRUE,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Runs executions as DAGs, dispatching every ready node concurrently
pub struct ExecutionEngine {
    resolver: TaskParamsResolver,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn ExecutionStore>,
    http: HttpRequester,
    retry_delay: Duration,
    script_max_operations: u64,
}

/// Everything one scheduler loop needs. The loop takes ownership of the
/// context and is its only writer.
pub struct ExecutionRun {
    pub graph: Arc<WorkflowGraph>,
    pub record: WorkflowExecution,
    pub context: ExecutionContext,
    pub cancel: CancellationToken,
    pub events: EventEmitter,
}

/// Final record of a run. `persisted` is false when the store refused a write
/// and the record only exists in memory.
#[derive(Debug)]
pub struct RunOutcome {
    pub record: WorkflowExecution,
    pub persisted: bool,
}

impl ExecutionEngine {
    pub fn new(
        resolver: TaskParamsResolver,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn ExecutionStore>,
        http: HttpRequester,
        retry_delay: Duration,
        script_max_operations: u64,
    ) -> Self {
        Self {
            resolver,
            queue,
            store,
            http,
            retry_delay,
            script_max_operations,
        }
    }

    /// Drive the execution to a terminal status
    pub async fn run(&self, run: ExecutionRun) -> RunOutcome {
        let execution_id = run.record.execution_id;
        tracing::info!(
            "Starting execution {} of workflow {}",
            execution_id,
            run.record.workflow_id
        );

        let mut scheduler = Scheduler {
            engine: self,
            graph: run.graph,
            record: run.record,
            context: run.context,
            cancel: run.cancel,
            events: run.events,
            running: FuturesUnordered::new(),
            cancelled: false,
        };
        let driven = scheduler.drive().await;
        let outcome = scheduler.finish(driven).await;

        tracing::info!(
            "Execution {} finished with status {}",
            execution_id,
            outcome.record.status
        );
        outcome
    }
}

/// What a dispatched unit hands back to the loop
struct Completion {
    started_at: DateTime<Utc>,
    attempts: u32,
    result: Result<UnitOutput, NodeError>,
}

#[derive(Default)]
struct UnitOutput {
    output: Option<Value>,
    changes: VarChanges,
}

impl UnitOutput {
    fn value(output: Value) -> Self {
        Self {
            output: Some(output),
            changes: VarChanges::default(),
        }
    }
}

type RunningUnit = BoxFuture<'static, (NodeId, Result<Completion, JoinError>)>;

#[derive(Debug, PartialEq)]
enum Readiness {
    Waiting,
    Ready,
    Skip,
    Blocked,
}

#[derive(Debug, PartialEq)]
enum EdgeState {
    Unresolved,
    Live,
    Dead,
    Blocks,
}

enum Wake {
    Cancelled,
    Finished(NodeId, Result<Completion, JoinError>),
    Idle,
}

struct Scheduler<'e> {
    engine: &'e ExecutionEngine,
    graph: Arc<WorkflowGraph>,
    record: WorkflowExecution,
    context: ExecutionContext,
    cancel: CancellationToken,
    events: EventEmitter,
    running: FuturesUnordered<RunningUnit>,
    cancelled: bool,
}

impl<'e> Scheduler<'e> {
    async fn drive(&mut self) -> Result<(), StoreError> {
        self.skip_unreachable().await?;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancel_remaining().await;
            }

            self.advance().await?;

            if self.running.is_empty() {
                if self.cancel.is_cancelled() {
                    return self.cancel_remaining().await;
                }
                return Ok(());
            }

            // Cancellation wins over a unit that finished in the same poll
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                joined = self.running.next() => match joined {
                    Some((node_id, joined)) => Wake::Finished(node_id, joined),
                    None => Wake::Idle,
                },
            };

            match wake {
                Wake::Cancelled => return self.cancel_remaining().await,
                Wake::Finished(node_id, joined) => {
                    let completion = joined.unwrap_or_else(|e| Completion {
                        started_at: self.started_at(&node_id),
                        attempts: 1,
                        result: Err(NodeError::ExecutionFailed(format!("node task aborted: {}", e))),
                    });
                    self.complete(&node_id, completion).await?;
                }
                Wake::Idle => {}
            }
        }
    }

    /// Nodes the start node can never reach are skipped up front
    async fn skip_unreachable(&mut self) -> Result<(), StoreError> {
        let graph = self.graph.clone();
        let reachable = graph.reachable_from_start();
        for node_id in graph.topological_order() {
            if !reachable.contains(node_id) && self.context.node_status(node_id) == NodeStatus::Pending {
                tracing::info!("Node {} is unreachable from start, skipping", node_id);
                self.settle(node_id, NodeStatus::Skipped, None).await?;
            }
        }
        Ok(())
    }

    /// Skip or dispatch pending nodes until a full pass changes nothing.
    /// Walking in topological order lets skips cascade in one pass.
    async fn advance(&mut self) -> Result<(), StoreError> {
        let graph = self.graph.clone();
        loop {
            let mut progressed = false;
            for node_id in graph.topological_order() {
                if self.context.node_status(node_id) != NodeStatus::Pending {
                    continue;
                }
                match self.readiness(node_id) {
                    Readiness::Waiting | Readiness::Blocked => {}
                    Readiness::Skip => {
                        tracing::info!("Node {} has no live incoming edge, skipping", node_id);
                        self.settle(node_id, NodeStatus::Skipped, None).await?;
                        progressed = true;
                    }
                    Readiness::Ready => {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        self.dispatch(node_id).await?;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn readiness(&self, node_id: &str) -> Readiness {
        let incoming = self.graph.incoming(node_id);
        if incoming.is_empty() {
            return if node_id == self.graph.start() {
                Readiness::Ready
            } else {
                Readiness::Skip
            };
        }

        let mut any_live = false;
        let mut blocked = false;
        for edge in incoming {
            match self.edge_state(edge) {
                EdgeState::Unresolved => return Readiness::Waiting,
                EdgeState::Live => any_live = true,
                EdgeState::Blocks => blocked = true,
                EdgeState::Dead => {}
            }
        }

        if blocked {
            Readiness::Blocked
        } else if any_live {
            Readiness::Ready
        } else {
            Readiness::Skip
        }
    }

    fn edge_state(&self, edge: &WorkflowEdge) -> EdgeState {
        let Some(source) = self.graph.node(&edge.source) else {
            return EdgeState::Dead;
        };
        match self.context.node_status(&edge.source) {
            NodeStatus::Pending | NodeStatus::Running => EdgeState::Unresolved,
            NodeStatus::Skipped | NodeStatus::Cancelled => EdgeState::Dead,
            NodeStatus::Failed if source.policy().skip_on_failure => EdgeState::Live,
            NodeStatus::Failed => EdgeState::Blocks,
            NodeStatus::Success => {
                if !matches!(source.data, NodeData::Condition(_)) {
                    return EdgeState::Live;
                }
                let branch = self
                    .context
                    .get_upstream_output(&edge.source)
                    .and_then(|o| o.get("branch"))
                    .and_then(Value::as_bool);
                let taken = match (edge.source_handle.as_deref(), branch) {
                    (Some(HANDLE_TRUE), Some(true)) => true,
                    (Some(HANDLE_FALSE), Some(false)) => true,
                    _ => false,
                };
                if taken {
                    EdgeState::Live
                } else {
                    EdgeState::Dead
                }
            }
        }
    }

    async fn dispatch(&mut self, node_id: &str) -> Result<(), StoreError> {
        let graph = self.graph.clone();
        let Some(node) = graph.node(node_id) else {
            return Ok(());
        };

        let started_at = Utc::now();
        self.mark_running(node_id, started_at).await?;

        match &node.data {
            NodeData::Start(_) | NodeData::End(_) => {
                self.complete(node_id, immediate(started_at, Ok(UnitOutput::default())))
                    .await
            }
            NodeData::Parallel(_) => {
                let passed = UnitOutput {
                    output: self.upstream_input(node_id),
                    changes: VarChanges::default(),
                };
                self.complete(node_id, immediate(started_at, Ok(passed))).await
            }
            NodeData::Condition(data) => {
                let predecessors = graph.predecessors(node_id);
                let result = condition::evaluate(data, &predecessors, &self.context).map(|branch| {
                    tracing::info!("Condition {} took the {} branch", node_id, branch);
                    UnitOutput::value(serde_json::json!({ "branch": branch }))
                });
                self.complete(node_id, immediate(started_at, result)).await
            }
            NodeData::Task(data) => {
                let params = match self.engine.resolver.resolve_params(
                    &data.task_type,
                    &data.params,
                    &mut self.context,
                ) {
                    Ok(params) => params,
                    Err(e) => {
                        let completion = Completion {
                            started_at,
                            attempts: 0,
                            result: Err(e),
                        };
                        return self.complete(node_id, completion).await;
                    }
                };

                let queue = self.engine.queue.clone();
                let execution_id = self.context.execution_id();
                let cancel = self.cancel.clone();
                let task_type = data.task_type.clone();
                let owned_id = node_id.to_string();
                self.spawn_unit(node_id, started_at, data.policy(), move || {
                    let invocation = TaskInvocation::new(
                        execution_id,
                        owned_id.clone(),
                        task_type.clone(),
                        params.clone(),
                        cancel.clone(),
                    );
                    let queue = queue.clone();
                    async move { queue.enqueue(invocation).await.map(UnitOutput::value) }
                });
                Ok(())
            }
            NodeData::Script(data) => {
                let code = data.script_code.clone();
                let vars = self.context.get_all_global_vars();
                let input = self.upstream_input(node_id).unwrap_or(Value::Null);
                let max_operations = self.engine.script_max_operations;
                self.spawn_unit(node_id, started_at, data.policy, move || {
                    let code = code.clone();
                    let vars = vars.clone();
                    let input = input.clone();
                    async move {
                        let outcome = tokio::task::spawn_blocking(move || {
                            script::run_script(&code, vars, input, max_operations)
                        })
                        .await
                        .map_err(|e| NodeError::ExecutionFailed(format!("script task aborted: {}", e)))??;
                        Ok::<_, NodeError>(UnitOutput {
                            output: Some(outcome.output),
                            changes: outcome.changes,
                        })
                    }
                });
                Ok(())
            }
            NodeData::Http(data) => {
                let http = self.engine.http.clone();
                let request = data.clone();
                self.spawn_unit(node_id, started_at, data.policy, move || {
                    let http = http.clone();
                    let request = request.clone();
                    async move { http.send(&request).await.map(UnitOutput::value) }
                });
                Ok(())
            }
        }
    }

    fn spawn_unit<F, Fut>(
        &mut self,
        node_id: &str,
        started_at: DateTime<Utc>,
        policy: FailurePolicy,
        attempt: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<UnitOutput, NodeError>> + Send + 'static,
    {
        let retry_delay = self.engine.retry_delay;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let (attempts, result) = with_policy(policy, retry_delay, cancel, attempt).await;
            Completion {
                started_at,
                attempts,
                result,
            }
        });
        let node_id = node_id.to_string();
        self.running
            .push(handle.map(move |joined| (node_id, joined)).boxed());
    }

    /// Output fed to script and parallel nodes: the single predecessor's
    /// output, or an object keyed by predecessor id when there are several
    fn upstream_input(&self, node_id: &str) -> Option<Value> {
        let outputs: Vec<(&str, &Value)> = self
            .graph
            .predecessors(node_id)
            .into_iter()
            .filter_map(|p| self.context.get_upstream_output(p).map(|o| (p, o)))
            .collect();
        match outputs.as_slice() {
            [] => None,
            [(_, output)] => Some((*output).clone()),
            many => Some(Value::Object(
                many.iter()
                    .map(|(id, output)| (id.to_string(), (*output).clone()))
                    .collect::<Map<String, Value>>(),
            )),
        }
    }

    async fn mark_running(&mut self, node_id: &str, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        tracing::info!("Node {} started", node_id);
        self.context.update_node_status(node_id, NodeStatus::Running);
        if let Some(state) = self.context.node_state_mut(node_id) {
            state.attempts = 0;
            state.error = None;
            state.started_at = Some(started_at);
            state.completed_at = None;
        }
        self.checkpoint(node_id).await
    }

    /// Apply a unit's outcome to the context
    async fn complete(&mut self, node_id: &str, completion: Completion) -> Result<(), StoreError> {
        let Completion {
            started_at,
            attempts,
            result,
        } = completion;

        let (status, error) = match result {
            Ok(unit) => {
                for (name, value) in unit.changes.set {
                    self.context.set_global_var(name, value);
                }
                for name in &unit.changes.removed {
                    self.context.delete_global_var(name);
                }
                self.context
                    .set_node_result(node_id, NodeResult::success(unit.output, started_at));
                tracing::info!("Node {} completed after {} attempt(s)", node_id, attempts);
                (NodeStatus::Success, None)
            }
            Err(NodeError::Cancelled) => {
                tracing::info!("Node {} cancelled after {} attempt(s)", node_id, attempts);
                (NodeStatus::Cancelled, None)
            }
            Err(e) => {
                let message = e.to_string();
                self.context
                    .set_node_result(node_id, NodeResult::failure(message.clone(), started_at));
                tracing::error!("Node {} failed after {} attempt(s): {}", node_id, attempts, message);
                (NodeStatus::Failed, Some(message))
            }
        };

        self.context.update_node_status(node_id, status);
        if let Some(state) = self.context.node_state_mut(node_id) {
            state.attempts = attempts;
        }
        self.settle(node_id, status, error).await
    }

    /// Move a node into a terminal status and checkpoint
    async fn settle(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.context.update_node_status(node_id, status);
        if let Some(state) = self.context.node_state_mut(node_id) {
            state.error = error;
            state.completed_at = Some(Utc::now());
        }
        self.checkpoint(node_id).await
    }

    async fn cancel_remaining(&mut self) -> Result<(), StoreError> {
        self.cancelled = true;
        tracing::info!("Cancelling execution {}", self.record.execution_id);
        let graph = self.graph.clone();
        for node_id in graph.topological_order() {
            if !self.context.node_status(node_id).is_terminal() {
                self.settle(node_id, NodeStatus::Cancelled, None).await?;
            }
        }
        // In-flight units are detached, their results are discarded
        self.running.clear();
        Ok(())
    }

    /// Persist the full record, then tell subscribers about `node_id`
    async fn checkpoint(&mut self, node_id: &str) -> Result<(), StoreError> {
        self.record.checkpoint(&self.context);
        self.engine.store.save(&self.record).await?;
        if let Some(state) = self.context.get_node_state(node_id) {
            self.events
                .emit(ExecutionEvent::node(self.events.execution_id(), state));
        }
        Ok(())
    }

    /// Settle every non-terminal node as cancelled without touching the
    /// store, which has already refused a write
    fn abandon_unsettled(&mut self) {
        let graph = self.graph.clone();
        for node_id in graph.topological_order() {
            if self.context.node_status(node_id).is_terminal() {
                continue;
            }
            self.context.update_node_status(node_id, NodeStatus::Cancelled);
            if let Some(state) = self.context.node_state_mut(node_id) {
                state.completed_at = Some(Utc::now());
                self.events
                    .emit(ExecutionEvent::node(self.events.execution_id(), state));
            }
        }
    }

    fn started_at(&self, node_id: &str) -> DateTime<Utc> {
        self.context
            .get_node_state(node_id)
            .and_then(|s| s.started_at)
            .unwrap_or_else(Utc::now)
    }

    fn outcome(&self) -> (ExecutionStatus, Option<String>) {
        // A unit that gave up on its own still counts as a cancelled run
        let unit_cancelled = self
            .graph
            .topological_order()
            .iter()
            .any(|id| self.context.node_status(id) == NodeStatus::Cancelled);
        if self.cancelled || unit_cancelled {
            return (ExecutionStatus::Cancelled, None);
        }

        let mut failures = Vec::new();
        let mut stuck = Vec::new();
        for node_id in self.graph.topological_order() {
            let Some(state) = self.context.get_node_state(node_id) else {
                stuck.push(node_id.as_str());
                continue;
            };
            match state.status {
                NodeStatus::Failed => {
                    let tolerated = self
                        .graph
                        .node(node_id)
                        .is_some_and(|n| n.policy().skip_on_failure);
                    if !tolerated {
                        failures.push(format!(
                            "{}: {}",
                            node_id,
                            state.error.as_deref().unwrap_or("failed")
                        ));
                    }
                }
                NodeStatus::Pending | NodeStatus::Running => stuck.push(node_id.as_str()),
                _ => {}
            }
        }

        if !failures.is_empty() {
            (
                ExecutionStatus::Failed,
                Some(format!("Node failure: {}", failures.join("; "))),
            )
        } else if !stuck.is_empty() {
            (
                ExecutionStatus::Failed,
                Some(format!("Nodes never became ready: {}", stuck.join(", "))),
            )
        } else {
            (ExecutionStatus::Success, None)
        }
    }

    async fn finish(mut self, driven: Result<(), StoreError>) -> RunOutcome {
        let (status, error, mut persisted) = match driven {
            Ok(()) => {
                let (status, error) = self.outcome();
                (status, error, true)
            }
            Err(e) => {
                tracing::error!(
                    "Execution {} lost its checkpoint store: {}",
                    self.record.execution_id,
                    e
                );
                // Stop whatever is still in flight
                self.cancel.cancel();
                self.running.clear();
                self.abandon_unsettled();
                (ExecutionStatus::Failed, Some(format!("Persistence error: {}", e)), false)
            }
        };

        self.record.checkpoint(&self.context);
        self.record.finish(status, error);

        if persisted {
            if let Err(e) = self.engine.store.save(&self.record).await {
                tracing::error!(
                    "Failed to persist final record of execution {}: {}",
                    self.record.execution_id,
                    e
                );
                self.record.status = ExecutionStatus::Failed;
                self.record.error = Some(format!("Persistence error: {}", e));
                persisted = false;
            }
        }

        RunOutcome {
            record: self.record,
            persisted,
        }
    }
}

fn immediate(started_at: DateTime<Utc>, result: Result<UnitOutput, NodeError>) -> Completion {
    Completion {
        started_at,
        attempts: 1,
        result,
    }
}

/// Run `attempt` under the node's failure policy: each attempt raced against
/// `timeoutMs`, retryable failures re-attempted up to `retryCount` times.
/// Returns how many attempts were made.
async fn with_policy<T, F, Fut>(
    policy: FailurePolicy,
    retry_delay: Duration,
    cancel: CancellationToken,
    mut attempt: F,
) -> (u32, Result<T, NodeError>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return (attempts, Err(NodeError::Cancelled));
        }
        attempts += 1;

        let result = if policy.timeout_ms > 0 {
            timeout(Duration::from_millis(policy.timeout_ms), attempt())
                .await
                .unwrap_or(Err(NodeError::Timeout {
                    timeout_ms: policy.timeout_ms,
                }))
        } else {
            attempt().await
        };

        match result {
            Err(e) if e.is_retryable() && attempts <= policy.retry_count => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}; retrying",
                    attempts,
                    policy.retry_count + 1,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (attempts, Err(NodeError::Cancelled)),
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            other => return (attempts, other),
        }
    }
}
