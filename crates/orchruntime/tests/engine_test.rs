use async_trait::async_trait;
use orchcore::{
    ConditionType, ExecutionEventType, ExecutionId, ExecutionStatus, ExecutionSummary, NodeError,
    NodeStatus, Progress, StoreError, TaskHandler, TaskInvocation, WorkflowDefinition,
    WorkflowExecution, WorkflowNode,
};
use orchcore::rpc::Page;
use orchruntime::{
    ExecutionStore, FileExecutionStore, InMemoryExecutionStore, InMemoryWorkflowStore,
    LocalTaskQueue, Orchestrator, RuntimeConfig, TaskDefinition, TaskQueue, TaskRegistry,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Notify};
use tokio::time::{sleep, timeout, Duration};

// Registry entry without a schema
struct Plain(String);

impl TaskDefinition for Plain {
    fn name(&self) -> &str {
        &self.0
    }
}

// Requires a `model` param
struct Strict;

impl TaskDefinition for Strict {
    fn name(&self) -> &str {
        "strict"
    }

    fn params_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["model"],
            "properties": {"model": {"type": "string"}}
        }))
    }
}

/// Replays `plan` one step per call, repeating the last step
struct Scripted {
    calls: AtomicU32,
    plan: Vec<Result<Value, String>>,
}

impl Scripted {
    fn new(plan: Vec<Result<Value, String>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            plan,
        })
    }

    fn ok(output: Value) -> Arc<Self> {
        Self::new(vec![Ok(output)])
    }

    fn failing(message: &str) -> Arc<Self> {
        Self::new(vec![Err(message.to_string())])
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for Scripted {
    async fn handle(&self, _invocation: TaskInvocation) -> Result<Value, NodeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let step = self
            .plan
            .get(n)
            .or(self.plan.last())
            .cloned()
            .unwrap_or(Ok(Value::Null));
        step.map_err(NodeError::ExecutionFailed)
    }
}

/// Sleeps unless the execution is cancelled first
struct Sleeper(u64);

#[async_trait]
impl TaskHandler for Sleeper {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        tokio::select! {
            _ = invocation.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(self.0)) => Ok(json!({"slept": self.0})),
        }
    }
}

/// Abandons its work without the execution being cancelled
struct GivesUp(AtomicU32);

#[async_trait]
impl TaskHandler for GivesUp {
    async fn handle(&self, _invocation: TaskInvocation) -> Result<Value, NodeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(NodeError::Cancelled)
    }
}

/// Holds until released
struct Gate(Arc<Notify>);

#[async_trait]
impl TaskHandler for Gate {
    async fn handle(&self, _invocation: TaskInvocation) -> Result<Value, NodeError> {
        self.0.notified().await;
        Ok(json!({"released": true}))
    }
}

/// Only completes once every branch sharing the barrier is running
struct Rendezvous(Arc<Barrier>);

#[async_trait]
impl TaskHandler for Rendezvous {
    async fn handle(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        self.0.wait().await;
        Ok(json!({"from": invocation.node_id}))
    }
}

/// Execution store that can be told to refuse every save
struct FlakyStore {
    inner: InMemoryExecutionStore,
    refuse_saves: AtomicBool,
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn create(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        self.inner.create(record).await
    }

    async fn save(&self, record: &WorkflowExecution) -> Result<(), StoreError> {
        if self.refuse_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.save(record).await
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<WorkflowExecution>, StoreError> {
        self.inner.get(execution_id).await
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>, StoreError> {
        self.inner.list_by_workflow(workflow_id, limit).await
    }

    async fn list_page(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ExecutionSummary>, StoreError> {
        self.inner.list_page(page, page_size).await
    }
}

fn orchestrator(
    handlers: Vec<(&str, Arc<dyn TaskHandler>)>,
    store: Arc<dyn ExecutionStore>,
) -> Orchestrator {
    let queue = Arc::new(LocalTaskQueue::new());
    let mut registry = TaskRegistry::new();
    for (name, handler) in handlers {
        registry.register(Arc::new(Plain(name.to_string()))).unwrap();
        queue.define(name, handler);
    }
    registry.register(Arc::new(Strict)).unwrap();
    queue.define("strict", Scripted::ok(json!({})));

    let config = RuntimeConfig {
        retry_delay_ms: 0,
        ..RuntimeConfig::default()
    };
    Orchestrator::new(
        Arc::new(registry),
        queue,
        Arc::new(InMemoryWorkflowStore::new()),
        store,
        config,
    )
}

fn handler<T: TaskHandler + 'static>(name: &str, handler: Arc<T>) -> (&str, Arc<dyn TaskHandler>) {
    (name, handler)
}

fn in_memory() -> Arc<dyn ExecutionStore> {
    Arc::new(InMemoryExecutionStore::new())
}

/// start -> each of `steps` in order -> end
fn chain(id: &str, steps: Vec<WorkflowNode>) -> WorkflowDefinition {
    let mut wf = WorkflowDefinition::new(id, format!("Chain {}", id));
    let mut previous = wf.add_node(WorkflowNode::start("start"));
    for step in steps {
        let next = wf.add_node(step);
        wf.connect(previous, next.clone());
        previous = next;
    }
    wf.add_node(WorkflowNode::end("end"));
    wf.connect(previous, "end");
    wf
}

async fn run(orch: &Orchestrator, workflow_id: &str, vars: Value) -> WorkflowExecution {
    let vars: HashMap<String, Value> = serde_json::from_value(vars).unwrap();
    let response = orch.trigger_workflow(workflow_id, vars).await.unwrap();
    assert!(response.success);
    finish(orch, response.execution_id.unwrap()).await
}

async fn finish(orch: &Orchestrator, execution_id: ExecutionId) -> WorkflowExecution {
    timeout(Duration::from_secs(10), orch.wait_for_completion(execution_id))
        .await
        .expect("execution did not finish in time")
        .unwrap()
}

async fn wait_for_node(orch: &Orchestrator, execution_id: ExecutionId, node_id: &str, status: NodeStatus) {
    for _ in 0..500 {
        let record = orch.get_execution(execution_id).await.unwrap();
        if record.node_states.get(node_id).map(|s| s.status) == Some(status) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("node {} never reached {}", node_id, status);
}

fn status_of(record: &WorkflowExecution, node_id: &str) -> NodeStatus {
    record.node_states[node_id].status
}

#[tokio::test]
async fn test_start_task_end_succeeds_with_full_progress() {
    let t1 = Scripted::ok(json!({"y": 2}));
    let orch = orchestrator(vec![handler("t1", t1.clone())], in_memory());
    orch.save_workflow(chain("simple", vec![WorkflowNode::task("T1", "t1")]))
        .await
        .unwrap();

    let record = run(&orch, "simple", json!({"x": 1})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(
        record.progress(),
        Progress {
            total: 3,
            completed: 3,
            failed: 0,
            running: 0
        }
    );
    assert_eq!(t1.calls(), 1);

    let summaries = orch.list_executions("simple", 10).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, ExecutionStatus::Success);
    assert_eq!(summaries[0].progress.completed, 3);

    let context = orchcore::ExecutionContext::from_snapshot(record.context.clone());
    assert_eq!(context.get_upstream_output("T1"), Some(&json!({"y": 2})));
    assert_eq!(context.get_global_var("x"), Some(&json!(1)));
}

#[tokio::test]
async fn test_condition_skips_unchosen_branch() {
    let chosen = Scripted::ok(json!({}));
    let rejected = Scripted::ok(json!({}));
    let orch = orchestrator(
        vec![
            handler("check", Scripted::ok(json!({"ok": true}))),
            handler("chosen", chosen.clone()),
            handler("rejected", rejected.clone()),
        ],
        in_memory(),
    );

    let mut wf = WorkflowDefinition::new("branching", "Branching");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::task("check", "check"));
    wf.add_node(WorkflowNode::condition("gate", ConditionType::PreviousNodeSuccess));
    wf.add_node(WorkflowNode::task("yes", "chosen"));
    wf.add_node(WorkflowNode::task("no", "rejected"));
    wf.add_node(WorkflowNode::task("no_followup", "rejected"));
    wf.add_node(WorkflowNode::parallel("join"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "check");
    wf.connect("check", "gate");
    wf.connect_branch("gate", true, "yes");
    wf.connect_branch("gate", false, "no");
    wf.connect("no", "no_followup");
    wf.connect("yes", "join");
    wf.connect("no_followup", "join");
    wf.connect("join", "end");
    orch.save_workflow(wf).await.unwrap();

    let record = run(&orch, "branching", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(status_of(&record, "yes"), NodeStatus::Success);
    assert_eq!(status_of(&record, "no"), NodeStatus::Skipped);
    assert_eq!(status_of(&record, "no_followup"), NodeStatus::Skipped);
    assert_eq!(status_of(&record, "join"), NodeStatus::Success);
    assert_eq!(status_of(&record, "end"), NodeStatus::Success);
    assert_eq!(chosen.calls(), 1);
    assert_eq!(rejected.calls(), 0);
}

#[tokio::test]
async fn test_retry_count_two_gives_three_invocations() {
    let flaky = Scripted::new(vec![
        Err("first".to_string()),
        Err("second".to_string()),
        Ok(json!({"done": true})),
    ]);
    let orch = orchestrator(vec![handler("flaky", flaky.clone())], in_memory());
    orch.save_workflow(chain("retry", vec![WorkflowNode::task("work", "flaky").with_retry(2)]))
        .await
        .unwrap();

    let record = run(&orch, "retry", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(status_of(&record, "work"), NodeStatus::Success);
    assert_eq!(record.node_states["work"].attempts, 3);
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn test_skip_on_failure_lets_successor_run() {
    let after = Scripted::ok(json!({}));
    let orch = orchestrator(
        vec![handler("broken", Scripted::failing("nope")), handler("after", after.clone())],
        in_memory(),
    );
    orch.save_workflow(chain(
        "tolerant",
        vec![
            WorkflowNode::task("optional", "broken").skip_on_failure(),
            WorkflowNode::task("next", "after"),
        ],
    ))
    .await
    .unwrap();

    let record = run(&orch, "tolerant", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(status_of(&record, "optional"), NodeStatus::Failed);
    assert_eq!(status_of(&record, "next"), NodeStatus::Success);
    assert_eq!(after.calls(), 1);
}

#[tokio::test]
async fn test_failure_without_skip_fails_run_and_leaves_downstream_pending() {
    let after = Scripted::ok(json!({}));
    let orch = orchestrator(
        vec![handler("broken", Scripted::failing("nope")), handler("after", after.clone())],
        in_memory(),
    );
    orch.save_workflow(chain(
        "strict-chain",
        vec![
            WorkflowNode::task("required", "broken"),
            WorkflowNode::task("next", "after"),
        ],
    ))
    .await
    .unwrap();

    let record = run(&orch, "strict-chain", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("required"));
    assert_eq!(status_of(&record, "required"), NodeStatus::Failed);
    assert_eq!(status_of(&record, "next"), NodeStatus::Pending);
    assert_eq!(after.calls(), 0);
}

#[tokio::test]
async fn test_resume_reinvokes_only_unfinished_nodes_against_snapshot() {
    let a = Scripted::ok(json!({"a": 1}));
    let b = Scripted::new(vec![Err("transient".to_string()), Ok(json!({"b": 2}))]);
    let c = Scripted::ok(json!({"c": 3}));
    let orch = orchestrator(
        vec![handler("a", a.clone()), handler("b", b.clone()), handler("c", c.clone())],
        in_memory(),
    );
    let original = chain(
        "resumable",
        vec![
            WorkflowNode::task("A", "a"),
            WorkflowNode::task("B", "b"),
            WorkflowNode::task("C", "c"),
        ],
    );
    orch.save_workflow(original.clone()).await.unwrap();

    let first = run(&orch, "resumable", json!({})).await;
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(status_of(&first, "A"), NodeStatus::Success);
    assert_eq!(status_of(&first, "B"), NodeStatus::Failed);
    assert_eq!(status_of(&first, "C"), NodeStatus::Pending);

    // Editing the live definition must not affect the resume
    orch.save_workflow(chain("resumable", vec![WorkflowNode::task("A", "a")]))
        .await
        .unwrap();

    let response = orch.retry_execution(first.execution_id).await.unwrap();
    assert!(response.success);
    let resumed_id = response.new_execution_id.unwrap();
    assert_ne!(resumed_id, first.execution_id);

    let resumed = finish(&orch, resumed_id).await;
    assert_eq!(resumed.status, ExecutionStatus::Success);
    assert_eq!(resumed.retry_of, Some(first.execution_id));
    assert_eq!(resumed.snapshot, original);
    assert_eq!(status_of(&resumed, "C"), NodeStatus::Success);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 2);
    assert_eq!(c.calls(), 1);

    // The original record is untouched and a successful run cannot be retried
    let original_record = orch.get_execution(first.execution_id).await.unwrap();
    assert_eq!(original_record.status, ExecutionStatus::Failed);
    let refused = orch.retry_execution(resumed_id).await.unwrap();
    assert!(!refused.success);
    assert!(refused.new_execution_id.is_none());
}

#[tokio::test]
async fn test_cancel_marks_non_terminal_nodes_cancelled() {
    let orch = orchestrator(vec![handler("slow", Arc::new(Sleeper(30_000)))], in_memory());
    orch.save_workflow(chain("cancellable", vec![WorkflowNode::task("wait", "slow")]))
        .await
        .unwrap();

    let response = orch
        .trigger_workflow("cancellable", HashMap::new())
        .await
        .unwrap();
    let id = response.execution_id.unwrap();
    wait_for_node(&orch, id, "wait", NodeStatus::Running).await;

    let cancel = orch.cancel_execution(id).await.unwrap();
    assert!(cancel.success);

    let record = finish(&orch, id).await;
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(status_of(&record, "start"), NodeStatus::Success);
    assert_eq!(status_of(&record, "wait"), NodeStatus::Cancelled);
    assert_eq!(status_of(&record, "end"), NodeStatus::Cancelled);

    // Idempotent once terminal
    let again = orch.cancel_execution(id).await.unwrap();
    assert!(again.success);

    let mut subscription = orch.subscribe(id).await.unwrap();
    let event = subscription.next().await.unwrap();
    assert_eq!(event.event_type, ExecutionEventType::ExecutionCancelled);
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_timeout_fails_node() {
    let orch = orchestrator(vec![handler("slow", Arc::new(Sleeper(5_000)))], in_memory());
    orch.save_workflow(chain(
        "deadline",
        vec![WorkflowNode::task("wait", "slow").with_timeout(50)],
    ))
    .await
    .unwrap();

    let record = run(&orch, "deadline", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(status_of(&record, "wait"), NodeStatus::Failed);
    assert!(record.node_states["wait"]
        .error
        .as_deref()
        .unwrap()
        .contains("Timeout"));
}

#[tokio::test]
async fn test_invalid_params_fail_without_dispatch_or_retry() {
    let orch = orchestrator(vec![], in_memory());
    orch.save_workflow(chain(
        "invalid",
        vec![WorkflowNode::task("model", "strict").with_retry(3)],
    ))
    .await
    .unwrap();

    let record = run(&orch, "invalid", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    let state = &record.node_states["model"];
    assert_eq!(state.status, NodeStatus::Failed);
    assert_eq!(state.attempts, 0);
    assert!(state.error.as_deref().unwrap().contains("Invalid params"));
}

#[tokio::test]
async fn test_unknown_task_type_fails_node() {
    let orch = orchestrator(vec![], in_memory());
    orch.save_workflow(chain("unknown", vec![WorkflowNode::task("mystery", "does.not.exist")]))
        .await
        .unwrap();

    let record = run(&orch, "unknown", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.node_states["mystery"]
        .error
        .as_deref()
        .unwrap()
        .contains("Unknown task type"));
}

#[tokio::test]
async fn test_script_updates_vars_for_condition() {
    let orch = orchestrator(vec![], in_memory());

    let mut wf = WorkflowDefinition::new("scripted", "Scripted");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::script("compute", "vars.total = vars.x + 1; vars.total"));
    wf.add_node(
        WorkflowNode::condition("check", ConditionType::KeyValueMatch).with_expression("total == 2"),
    );
    wf.add_node(WorkflowNode::end("matched"));
    wf.add_node(WorkflowNode::end("unmatched"));
    wf.connect("start", "compute");
    wf.connect("compute", "check");
    wf.connect_branch("check", true, "matched");
    wf.connect_branch("check", false, "unmatched");
    orch.save_workflow(wf).await.unwrap();

    let record = run(&orch, "scripted", json!({"x": 1})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(status_of(&record, "matched"), NodeStatus::Success);
    assert_eq!(status_of(&record, "unmatched"), NodeStatus::Skipped);

    let context = orchcore::ExecutionContext::from_snapshot(record.context.clone());
    assert_eq!(context.get_global_var("total"), Some(&json!(2)));
    assert_eq!(context.get_upstream_output("compute"), Some(&json!(2)));
}

#[tokio::test]
async fn test_parallel_branches_run_concurrently_and_join() {
    let barrier = Arc::new(Barrier::new(2));
    let orch = orchestrator(
        vec![handler("meet", Arc::new(Rendezvous(barrier)))],
        in_memory(),
    );

    let mut wf = WorkflowDefinition::new("fanout", "Fan out");
    wf.add_node(WorkflowNode::start("start"));
    wf.add_node(WorkflowNode::parallel("split"));
    wf.add_node(WorkflowNode::task("left", "meet"));
    wf.add_node(WorkflowNode::task("right", "meet"));
    wf.add_node(WorkflowNode::script("merge", "input"));
    wf.add_node(WorkflowNode::end("end"));
    wf.connect("start", "split");
    wf.connect("split", "left");
    wf.connect("split", "right");
    wf.connect("left", "merge");
    wf.connect("right", "merge");
    wf.connect("merge", "end");
    orch.save_workflow(wf).await.unwrap();

    // Sequential dispatch would deadlock on the barrier
    let record = run(&orch, "fanout", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    let context = orchcore::ExecutionContext::from_snapshot(record.context.clone());
    assert_eq!(
        context.get_upstream_output("merge"),
        Some(&json!({"left": {"from": "left"}, "right": {"from": "right"}}))
    );
}

#[tokio::test]
async fn test_unreachable_nodes_are_skipped() {
    let island = Scripted::ok(json!({}));
    let orch = orchestrator(
        vec![handler("main", Scripted::ok(json!({}))), handler("island", island.clone())],
        in_memory(),
    );
    let mut wf = chain("islands", vec![WorkflowNode::task("work", "main")]);
    wf.add_node(WorkflowNode::task("orphan", "island"));
    wf.connect("orphan", "end");
    orch.save_workflow(wf).await.unwrap();

    let record = run(&orch, "islands", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(status_of(&record, "orphan"), NodeStatus::Skipped);
    assert_eq!(status_of(&record, "end"), NodeStatus::Success);
    assert_eq!(island.calls(), 0);
}

#[tokio::test]
async fn test_http_node_failure_is_retried() {
    let orch = orchestrator(vec![], in_memory());
    orch.save_workflow(chain(
        "http",
        vec![WorkflowNode::http("call", "http://127.0.0.1:1/unreachable").with_retry(1)],
    ))
    .await
    .unwrap();

    let record = run(&orch, "http", json!({})).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(status_of(&record, "call"), NodeStatus::Failed);
    assert_eq!(record.node_states["call"].attempts, 2);
}

#[tokio::test]
async fn test_subscription_streams_node_events_then_terminal() {
    let release = Arc::new(Notify::new());
    let orch = orchestrator(vec![handler("gated", Arc::new(Gate(release.clone())))], in_memory());
    orch.save_workflow(chain("observed", vec![WorkflowNode::task("T1", "gated")]))
        .await
        .unwrap();

    let id = orch
        .trigger_workflow("observed", HashMap::new())
        .await
        .unwrap()
        .execution_id
        .unwrap();
    let mut subscription = orch.subscribe(id).await.unwrap();
    release.notify_one();

    let mut seen = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), subscription.next())
        .await
        .unwrap()
    {
        assert_eq!(event.execution_id, id);
        seen.push((event.event_type, event.node_id));
    }

    let tail = &seen[seen.len() - 4..];
    assert_eq!(
        tail,
        &[
            (ExecutionEventType::NodeCompleted, Some("T1".to_string())),
            (ExecutionEventType::NodeStarted, Some("end".to_string())),
            (ExecutionEventType::NodeCompleted, Some("end".to_string())),
            (ExecutionEventType::ExecutionCompleted, None),
        ]
    );
}

#[tokio::test]
async fn test_persistence_failure_fails_run_and_stays_visible() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryExecutionStore::new(),
        refuse_saves: AtomicBool::new(true),
    });
    let orch = orchestrator(vec![handler("t1", Scripted::ok(json!({})))], store.clone());
    orch.save_workflow(chain("fragile", vec![WorkflowNode::task("T1", "t1")]))
        .await
        .unwrap();

    let id = orch
        .trigger_workflow("fragile", HashMap::new())
        .await
        .unwrap()
        .execution_id
        .unwrap();
    let mut subscription = orch.subscribe(id).await.unwrap();
    let mut last = None;
    while let Some(event) = timeout(Duration::from_secs(10), subscription.next())
        .await
        .unwrap()
    {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.event_type, ExecutionEventType::ExecutionFailed);
    assert!(last.error.as_deref().unwrap().contains("disk full"));

    let record = orch.get_execution(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("Persistence error"));
    for node_id in ["start", "T1", "end"] {
        assert!(status_of(&record, node_id).is_terminal(), "{} left unsettled", node_id);
    }
    assert_eq!(record.progress().running, 0);

    // History agrees with the record even though the store still holds the
    // first checkpoint
    let listed = orch.list_executions("fragile", 10).await.unwrap();
    assert_eq!(listed[0].execution_id, id);
    assert_eq!(listed[0].status, ExecutionStatus::Failed);
    assert_eq!(listed[0].progress.running, 0);
    let page = orch.list_execution_page(1, 10).await.unwrap();
    assert_eq!(page.items[0].status, ExecutionStatus::Failed);
    let stored = store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_held_record_is_written_once_store_recovers() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryExecutionStore::new(),
        refuse_saves: AtomicBool::new(true),
    });
    let orch = orchestrator(vec![handler("t1", Scripted::ok(json!({})))], store.clone());
    orch.save_workflow(chain("fragile", vec![WorkflowNode::task("T1", "t1")]))
        .await
        .unwrap();

    let lost = run(&orch, "fragile", json!({})).await;
    assert_eq!(lost.status, ExecutionStatus::Failed);
    assert_eq!(
        store.get(lost.execution_id).await.unwrap().unwrap().status,
        ExecutionStatus::Running
    );

    store.refuse_saves.store(false, Ordering::SeqCst);
    let next = run(&orch, "fragile", json!({})).await;
    assert_eq!(next.status, ExecutionStatus::Success);

    let flushed = store.get(lost.execution_id).await.unwrap().unwrap();
    assert_eq!(flushed.status, ExecutionStatus::Failed);
    assert!(flushed.error.as_deref().unwrap().contains("Persistence error"));
    assert_eq!(
        orch.get_execution(lost.execution_id).await.unwrap().status,
        ExecutionStatus::Failed
    );
}

#[tokio::test]
async fn test_retry_resumes_execution_interrupted_by_restart() {
    let dir = tempfile::tempdir().unwrap();
    let before: Arc<dyn ExecutionStore> = Arc::new(FileExecutionStore::new(dir.path()).unwrap());
    let crashed = orchestrator(vec![handler("slow", Arc::new(Sleeper(30_000)))], before);
    crashed
        .save_workflow(chain("interrupted", vec![WorkflowNode::task("wait", "slow")]))
        .await
        .unwrap();
    let id = crashed
        .trigger_workflow("interrupted", HashMap::new())
        .await
        .unwrap()
        .execution_id
        .unwrap();
    wait_for_node(&crashed, id, "wait", NodeStatus::Running).await;

    // A second process over the same directory owns no scheduler for `id`
    let quick = Scripted::ok(json!({"done": true}));
    let after: Arc<dyn ExecutionStore> = Arc::new(FileExecutionStore::new(dir.path()).unwrap());
    let restarted = orchestrator(vec![handler("slow", quick.clone())], after);
    let left_behind = restarted.get_execution(id).await.unwrap();
    assert_eq!(left_behind.status, ExecutionStatus::Running);
    assert_eq!(status_of(&left_behind, "wait"), NodeStatus::Running);

    let response = restarted.retry_execution(id).await.unwrap();
    assert!(response.success, "{}", response.message);
    let resumed = finish(&restarted, response.new_execution_id.unwrap()).await;
    assert_eq!(resumed.status, ExecutionStatus::Success);
    assert_eq!(resumed.retry_of, Some(id));
    assert_eq!(status_of(&resumed, "start"), NodeStatus::Success);
    assert_eq!(status_of(&resumed, "wait"), NodeStatus::Success);
    assert_eq!(quick.calls(), 1);

    let closed = restarted.get_execution(id).await.unwrap();
    assert_eq!(closed.status, ExecutionStatus::Failed);
    assert!(closed.error.as_deref().unwrap().contains("Interrupted"));
    assert_eq!(status_of(&closed, "wait"), NodeStatus::Cancelled);

    // The process that still owns the run keeps refusing
    let refused = crashed.retry_execution(id).await.unwrap();
    assert!(!refused.success);
    crashed.cancel_execution(id).await.unwrap();
}

#[tokio::test]
async fn test_task_giving_up_is_cancelled_not_failed() {
    let gives_up = Arc::new(GivesUp(AtomicU32::new(0)));
    let orch = orchestrator(vec![handler("quit", gives_up.clone())], in_memory());
    orch.save_workflow(chain(
        "abandoned",
        vec![WorkflowNode::task("quit", "quit").with_retry(2)],
    ))
    .await
    .unwrap();

    let id = orch
        .trigger_workflow("abandoned", HashMap::new())
        .await
        .unwrap()
        .execution_id
        .unwrap();
    let mut subscription = orch.subscribe(id).await.unwrap();
    let mut seen = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(10), subscription.next())
        .await
        .unwrap()
    {
        seen.push(event.event_type);
    }
    assert!(!seen.contains(&ExecutionEventType::NodeFailed));
    assert_eq!(seen.last(), Some(&ExecutionEventType::ExecutionCancelled));

    let record = orch.get_execution(id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(status_of(&record, "quit"), NodeStatus::Cancelled);
    assert_eq!(status_of(&record, "end"), NodeStatus::Skipped);
    assert!(record.node_states["quit"].error.is_none());
    assert_eq!(gives_up.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_file_store_keeps_history_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ExecutionStore> = Arc::new(FileExecutionStore::new(dir.path()).unwrap());
    let orch = orchestrator(vec![handler("t1", Scripted::ok(json!({"y": 2})))], store);
    let definition = chain("durable", vec![WorkflowNode::task("T1", "t1")]);
    orch.save_workflow(definition.clone()).await.unwrap();

    let record = run(&orch, "durable", json!({"x": 1})).await;
    assert_eq!(record.status, ExecutionStatus::Success);

    let reopened = FileExecutionStore::new(dir.path()).unwrap();
    let stored = reopened.get(record.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Success);
    assert_eq!(stored.snapshot, definition);
    let page = reopened.list_page(1, 20).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_control_plane_errors() {
    let orch = orchestrator(vec![], in_memory());

    assert!(matches!(
        orch.get_workflow("missing").await,
        Err(orchcore::OrchestratorError::Workflow(orchcore::WorkflowError::NotFound(_)))
    ));
    assert!(orch.trigger_workflow("missing", HashMap::new()).await.is_err());
    assert!(matches!(
        orch.get_execution(uuid::Uuid::new_v4()).await,
        Err(orchcore::OrchestratorError::ExecutionNotFound(_))
    ));
    assert!(orch.cancel_execution(uuid::Uuid::new_v4()).await.is_err());

    let mut cyclic = chain("cyclic", vec![WorkflowNode::task("a", "x"), WorkflowNode::task("b", "x")]);
    cyclic.connect("b", "a");
    assert!(orch.save_workflow(cyclic).await.is_err());
    assert!(orch.list_workflows().await.is_empty());
}
