use crate::definitions::WorkflowStore;
use crate::executor::{ExecutionEngine, ExecutionRun};
use crate::graph::WorkflowGraph;
use crate::http::HttpRequester;
use crate::params::TaskParamsResolver;
use crate::queue::TaskQueue;
use crate::registry::TaskRegistry;
use crate::store::ExecutionStore;
use crate::subscription::{terminal_event, EventBus, Subscription};
use orchcore::rpc::{CancelResponse, Page, RetryResponse, TaskInfo, TriggerResponse, WorkflowSummary};
use orchcore::{
    ExecutionContext, ExecutionId, ExecutionStatus, ExecutionSummary, NodeStatus,
    OrchestratorError, Result, WorkflowDefinition, WorkflowError, WorkflowExecution,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Control plane over workflow definitions and their executions
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    engine: Arc<ExecutionEngine>,
    bus: Arc<EventBus>,
    active: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    // Final records the store refused to take
    unpersisted: Arc<RwLock<HashMap<ExecutionId, WorkflowExecution>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn TaskQueue>,
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        config: RuntimeConfig,
    ) -> Self {
        let resolver = TaskParamsResolver::new(registry.clone(), Arc::new(config.task_config.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            resolver,
            queue,
            executions.clone(),
            HttpRequester::new(config.http_timeout_ms),
            Duration::from_millis(config.retry_delay_ms),
            config.script_max_operations,
        ));

        Self {
            registry,
            workflows,
            executions,
            engine,
            bus: Arc::new(EventBus::new(config.event_buffer_size)),
            active: Arc::new(RwLock::new(HashMap::new())),
            unpersisted: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        self.registry
            .list_task_types()
            .into_iter()
            .filter_map(|name| self.registry.get_registered_task_by_name(&name))
            .map(|task| {
                let metadata = task.metadata();
                TaskInfo {
                    name: task.name().to_string(),
                    description: metadata.description,
                    category: metadata.category,
                    params_schema: task.params_schema().cloned(),
                }
            })
            .collect()
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .list()
            .await
            .iter()
            .map(WorkflowSummary::from)
            .collect()
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.workflows
            .get(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()).into())
    }

    /// Store a definition after checking it can be scheduled
    pub async fn save_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        WorkflowGraph::build(&definition)?;
        tracing::info!("Saving workflow {}", definition.id);
        self.workflows.save(definition).await?;
        Ok(())
    }

    /// Executions already started keep their own snapshot
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.workflows
            .delete(workflow_id)
            .await?
            .map(|_| tracing::info!("Deleted workflow {}", workflow_id))
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()).into())
    }

    /// Start a new execution and return as soon as it is persisted
    pub async fn trigger_workflow(
        &self,
        workflow_id: &str,
        global_vars: HashMap<String, Value>,
    ) -> Result<TriggerResponse> {
        let definition = self.get_workflow(workflow_id).await?;
        let graph = Arc::new(WorkflowGraph::build(&definition)?);

        let execution_id = Uuid::new_v4();
        let mut context = ExecutionContext::with_global_vars(execution_id, global_vars);
        for node_id in graph.topological_order() {
            context.update_node_status(node_id, NodeStatus::Pending);
        }

        let record = WorkflowExecution::start(definition, &context);
        self.executions.create(&record).await?;
        self.launch(graph, record, context).await;

        tracing::info!("Triggered workflow {} as execution {}", workflow_id, execution_id);
        Ok(TriggerResponse {
            success: true,
            execution_id: Some(execution_id),
            message: "Execution started".to_string(),
        })
    }

    /// Request cooperative cancellation. A no-op on finished executions.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<CancelResponse> {
        if let Some(token) = self.active.read().await.get(&execution_id) {
            token.cancel();
            tracing::info!("Cancellation requested for execution {}", execution_id);
            return Ok(CancelResponse {
                success: true,
                message: "Cancellation requested".to_string(),
            });
        }

        let record = self.get_execution(execution_id).await?;
        if record.status.is_terminal() {
            return Ok(CancelResponse {
                success: true,
                message: format!("Execution already {}", record.status),
            });
        }

        tracing::warn!("Execution {} has no active scheduler; marking it cancelled", execution_id);
        self.close_orphan(record, ExecutionStatus::Cancelled, None).await?;
        Ok(CancelResponse {
            success: true,
            message: "Execution cancelled".to_string(),
        })
    }

    /// Resume an unsuccessful execution from its checkpoint as a new
    /// execution, against the original snapshot. A record still marked
    /// running that no scheduler owns was interrupted; it is closed as
    /// failed and resumed like any other.
    pub async fn retry_execution(&self, execution_id: ExecutionId) -> Result<RetryResponse> {
        let record = self.get_execution(execution_id).await?;

        let refusal = if self.active.read().await.contains_key(&execution_id) {
            Some("Execution is still running")
        } else if record.status == ExecutionStatus::Success {
            Some("Execution already succeeded")
        } else {
            None
        };
        if let Some(message) = refusal {
            return Ok(RetryResponse {
                success: false,
                new_execution_id: None,
                message: message.to_string(),
            });
        }

        let graph = Arc::new(WorkflowGraph::build(&record.snapshot)?);
        let new_id = Uuid::new_v4();
        let mut context = ExecutionContext::from_snapshot(record.context.clone());
        context.reset_for_resume();
        let mut context = context.rebind(new_id);
        for node_id in graph.topological_order() {
            if context.get_node_state(node_id).is_none() {
                context.update_node_status(node_id, NodeStatus::Pending);
            }
        }

        let mut resumed = WorkflowExecution::start(record.snapshot.clone(), &context);
        resumed.retry_of = Some(execution_id);
        self.executions.create(&resumed).await?;

        if record.status == ExecutionStatus::Running {
            tracing::warn!(
                "Execution {} was interrupted before completion; closing it",
                execution_id
            );
            let reason = format!("Interrupted before completion; resumed as {}", new_id);
            self.close_orphan(record, ExecutionStatus::Failed, Some(reason))
                .await?;
        }
        self.launch(graph, resumed, context).await;

        tracing::info!("Resumed execution {} as {}", execution_id, new_id);
        Ok(RetryResponse {
            success: true,
            new_execution_id: Some(new_id),
            message: format!("Resumed from execution {}", execution_id),
        })
    }

    /// Newest first
    pub async fn list_executions(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let summaries = self.executions.list_by_workflow(workflow_id, limit).await?;
        Ok(self.overlay_unpersisted(summaries).await)
    }

    pub async fn list_execution_page(&self, page: usize, page_size: usize) -> Result<Page<ExecutionSummary>> {
        let mut page = self.executions.list_page(page, page_size).await?;
        page.items = self.overlay_unpersisted(page.items).await;
        Ok(page)
    }

    /// The store still holds the last checkpoint of runs whose final write
    /// was refused; report the in-memory final record instead
    async fn overlay_unpersisted(&self, summaries: Vec<ExecutionSummary>) -> Vec<ExecutionSummary> {
        let unpersisted = self.unpersisted.read().await;
        if unpersisted.is_empty() {
            return summaries;
        }
        summaries
            .into_iter()
            .map(|summary| match unpersisted.get(&summary.execution_id) {
                Some(record) => record.summary(),
                None => summary,
            })
            .collect()
    }

    pub async fn get_execution(&self, execution_id: ExecutionId) -> Result<WorkflowExecution> {
        if let Some(record) = self.unpersisted.read().await.get(&execution_id) {
            return Ok(record.clone());
        }
        self.executions
            .get(execution_id)
            .await?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Stream of updates for one execution, ending with its terminal event
    pub async fn subscribe(&self, execution_id: ExecutionId) -> Result<Subscription> {
        if let Some(subscription) = self.bus.subscribe(execution_id) {
            return Ok(subscription);
        }
        let record = self.get_execution(execution_id).await?;
        terminal_event(&record).map(Subscription::finished).ok_or_else(|| {
            OrchestratorError::Execution(format!(
                "execution {} is running but has no active scheduler",
                execution_id
            ))
        })
    }

    /// Block until the execution finishes and return its final record
    pub async fn wait_for_completion(&self, execution_id: ExecutionId) -> Result<WorkflowExecution> {
        let mut subscription = self.subscribe(execution_id).await?;
        while subscription.next().await.is_some() {}
        self.get_execution(execution_id).await
    }

    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        self.active.read().await.keys().copied().collect()
    }

    /// Finalize a non-terminal record that no scheduler owns, typically one
    /// left behind by a previous process
    async fn close_orphan(
        &self,
        mut record: WorkflowExecution,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<()> {
        for state in record.node_states.values_mut() {
            if !state.status.is_terminal() {
                state.status = NodeStatus::Cancelled;
            }
        }
        record.finish(status, error);
        self.executions.save(&record).await?;
        Ok(())
    }

    async fn launch(&self, graph: Arc<WorkflowGraph>, record: WorkflowExecution, context: ExecutionContext) {
        let execution_id = record.execution_id;
        let cancel = CancellationToken::new();
        let events = self.bus.open(execution_id);
        self.active.write().await.insert(execution_id, cancel.clone());

        let engine = self.engine.clone();
        let executions = self.executions.clone();
        let bus = self.bus.clone();
        let active = self.active.clone();
        let unpersisted = self.unpersisted.clone();
        let run = ExecutionRun {
            graph,
            record,
            context,
            cancel,
            events,
        };

        tokio::spawn(async move {
            let outcome = engine.run(run).await;
            if outcome.persisted {
                flush_unpersisted(executions.as_ref(), &unpersisted).await;
            } else {
                let mut held = unpersisted.write().await;
                held.insert(execution_id, outcome.record.clone());
                evict_oldest(&mut held, MAX_UNPERSISTED);
            }
            active.write().await.remove(&execution_id);
            if let Some(event) = terminal_event(&outcome.record) {
                bus.finish(event);
            }
        });
    }
}

/// Final records held in memory while the store refuses them
const MAX_UNPERSISTED: usize = 1000;

/// The store took a write again; hand it every record it refused earlier
async fn flush_unpersisted(
    executions: &dyn ExecutionStore,
    unpersisted: &RwLock<HashMap<ExecutionId, WorkflowExecution>>,
) {
    let pending: Vec<WorkflowExecution> = unpersisted.read().await.values().cloned().collect();
    for record in pending {
        match executions.save(&record).await {
            Ok(()) => {
                tracing::info!("Persisted held record of execution {}", record.execution_id);
                unpersisted.write().await.remove(&record.execution_id);
            }
            Err(e) => {
                tracing::warn!(
                    "Store still refuses execution {}: {}",
                    record.execution_id,
                    e
                );
                break;
            }
        }
    }
}

fn evict_oldest(held: &mut HashMap<ExecutionId, WorkflowExecution>, cap: usize) {
    while held.len() > cap {
        let Some(oldest) = held
            .values()
            .min_by_key(|r| r.completed_at)
            .map(|r| r.execution_id)
        else {
            return;
        };
        tracing::warn!("Dropping unpersisted record of execution {}", oldest);
        held.remove(&oldest);
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of each execution's event channel
    pub event_buffer_size: usize,
    /// Fixed delay between attempts of a failing node
    pub retry_delay_ms: u64,
    pub script_max_operations: u64,
    pub http_timeout_ms: u64,
    /// Handed to default-param generators
    pub task_config: Value,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            retry_delay_ms: 250,
            script_max_operations: 1_000_000,
            http_timeout_ms: 30_000,
            task_config: Value::Object(Default::default()),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `ORCH_*` environment variables. Unparsable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_number("ORCH_EVENT_BUFFER") {
            config.event_buffer_size = v as usize;
        }
        if let Some(v) = env_number("ORCH_RETRY_DELAY_MS") {
            config.retry_delay_ms = v;
        }
        if let Some(v) = env_number("ORCH_SCRIPT_MAX_OPS") {
            config.script_max_operations = v;
        }
        if let Some(v) = env_number("ORCH_HTTP_TIMEOUT_MS") {
            config.http_timeout_ms = v;
        }
        if let Ok(path) = std::env::var("ORCH_TASK_CONFIG") {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
            {
                Ok(value) => config.task_config = value,
                Err(e) => tracing::warn!("Ignoring ORCH_TASK_CONFIG {}: {}", path, e),
            }
        }
        config
    }
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={}: not a number", name, raw);
            None
        }
    }
}
