use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchcore::{
    ConditionType, ExecutionEvent, ExecutionEventType, ExecutionStatus, NodeData,
    WorkflowDefinition, WorkflowNode,
};
use orchruntime::{
    ExecutionStore, FileExecutionStore, InMemoryExecutionStore, InMemoryWorkflowStore,
    LocalTaskQueue, Orchestrator, RuntimeConfig, TaskRegistry, WorkflowGraph,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Workflow orchestrator CLI", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file and wait for it to finish
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Global variables as a JSON object
        #[arg(long)]
        vars: Option<String>,

        /// Keep execution records in this directory
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available task types
    Tasks,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run { file, vars, store } => run_workflow(&file, vars.as_deref(), store).await,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Tasks => {
            list_tasks();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(&output),
    }
}

fn builtin_registry() -> Result<(TaskRegistry, Arc<LocalTaskQueue>)> {
    let mut registry = TaskRegistry::new();
    let queue = Arc::new(LocalTaskQueue::new());
    orchtasks::register_all(&mut registry, queue.as_ref())?;
    Ok((registry, queue))
}

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))
}

fn parse_vars(vars: Option<&str>) -> Result<HashMap<String, Value>> {
    let Some(raw) = vars else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("--vars must be a JSON object"),
    }
}

async fn run_workflow(file: &Path, vars: Option<&str>, store: Option<PathBuf>) -> Result<()> {
    println!("Loading workflow from: {}", file.display());
    let definition = load_definition(file)?;
    let global_vars = parse_vars(vars)?;

    println!("Workflow: {} ({})", definition.name, definition.id);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Edges: {}", definition.edges.len());
    println!();

    let (registry, queue) = builtin_registry()?;
    let executions: Arc<dyn ExecutionStore> = match store {
        Some(dir) => Arc::new(FileExecutionStore::new(dir)?),
        None => Arc::new(InMemoryExecutionStore::new()),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        queue,
        Arc::new(InMemoryWorkflowStore::new()),
        executions,
        RuntimeConfig::from_env(),
    );

    let workflow_id = definition.id.clone();
    orchestrator.save_workflow(definition).await?;
    let response = orchestrator.trigger_workflow(&workflow_id, global_vars).await?;
    let execution_id = response
        .execution_id
        .context("trigger returned no execution id")?;

    let mut events = orchestrator.subscribe(execution_id).await?;
    while let Some(event) = events.next().await {
        print_event(&event);
    }

    let record = orchestrator.get_execution(execution_id).await?;
    let progress = record.progress();

    println!();
    println!("Execution Summary:");
    println!("   Execution ID: {}", record.execution_id);
    println!("   Status: {}", record.status);
    println!(
        "   Completed: {}/{} nodes ({} failed)",
        progress.completed, progress.total, progress.failed
    );

    let outputs: Vec<_> = record
        .context
        .node_results
        .iter()
        .filter_map(|(id, result)| result.output.as_ref().map(|o| (id, o)))
        .collect();
    if !outputs.is_empty() {
        println!();
        println!("Outputs:");
        for (node_id, output) in outputs {
            println!("   {}: {}", node_id, output);
        }
    }

    match record.status {
        ExecutionStatus::Success => Ok(()),
        status => bail!(
            "execution {} ended {}: {}",
            execution_id,
            status,
            record.error.unwrap_or_default()
        ),
    }
}

fn print_event(event: &ExecutionEvent) {
    let node = event.node_id.as_deref().unwrap_or("?");
    let state = event.node_state.as_ref();
    match event.event_type {
        ExecutionEventType::NodeStarted => println!("  > {} started", node),
        ExecutionEventType::NodeCompleted => println!(
            "  + {} completed after {} attempt(s)",
            node,
            state.map_or(0, |s| s.attempts)
        ),
        ExecutionEventType::NodeFailed => println!(
            "  x {} failed: {}",
            node,
            state.and_then(|s| s.error.as_deref()).unwrap_or("unknown error")
        ),
        ExecutionEventType::NodeSkipped => println!("  - {} skipped", node),
        ExecutionEventType::NodeCancelled => println!("  - {} cancelled", node),
        ExecutionEventType::ExecutionCompleted => println!("Workflow completed successfully"),
        ExecutionEventType::ExecutionFailed => println!(
            "Workflow failed: {}",
            event.error.as_deref().unwrap_or("unknown error")
        ),
        ExecutionEventType::ExecutionCancelled => println!("Workflow cancelled"),
    }
}

/// Structural checks plus a lookup of every task type in the built-in catalog
fn check_definition(definition: &WorkflowDefinition, registry: &TaskRegistry) -> Result<()> {
    WorkflowGraph::build(definition)?;

    let unknown: Vec<&str> = definition
        .nodes
        .iter()
        .filter_map(|node| match &node.data {
            NodeData::Task(task) if !registry.contains(&task.task_type) => Some(task.task_type.as_str()),
            _ => None,
        })
        .collect();
    if !unknown.is_empty() {
        bail!("unknown task types: {}", unknown.join(", "));
    }
    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("Validating workflow: {}", file.display());

    let definition = load_definition(file)?;
    let (registry, _) = builtin_registry()?;
    check_definition(&definition, &registry)?;

    println!("Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Nodes: {}", definition.nodes.len());
    println!("   Edges: {}", definition.edges.len());
    Ok(())
}

fn list_tasks() {
    println!("Available Task Types:");
    println!();

    let Ok((registry, _)) = builtin_registry() else {
        eprintln!("failed to load the built-in task catalog");
        return;
    };
    for task_type in registry.list_task_types() {
        if let Some(metadata) = registry.get_metadata(&task_type) {
            println!("  * {} ({})", task_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  * {}", task_type);
        }
    }
}

fn example_workflow() -> WorkflowDefinition {
    let mut workflow = WorkflowDefinition::new("example", "Example Window Report");
    workflow.description =
        Some("Resolves a reporting window and logs a report, or an alert if that fails".to_string());

    workflow.add_node(WorkflowNode::start("start").with_position(0.0, 100.0));
    workflow.add_node(
        WorkflowNode::task("window", "window.resolve")
            .with_retry(1)
            .skip_on_failure()
            .with_position(200.0, 100.0),
    );
    workflow.add_node(
        WorkflowNode::condition("ok", ConditionType::PreviousNodeSuccess).with_position(400.0, 100.0),
    );
    workflow.add_node(
        WorkflowNode::task("report", "debug.log")
            .with_param("message", "window resolved")
            .with_position(600.0, 0.0),
    );
    workflow.add_node(
        WorkflowNode::task("alert", "debug.log")
            .with_param("message", "window could not be resolved")
            .with_position(600.0, 200.0),
    );
    workflow.add_node(WorkflowNode::end("end").with_position(800.0, 100.0));

    workflow.connect("start", "window");
    workflow.connect("window", "ok");
    workflow.connect_branch("ok", true, "report");
    workflow.connect_branch("ok", false, "alert");
    workflow.connect("report", "end");
    workflow.connect("alert", "end");
    workflow
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_workflow())?;
    std::fs::write(output, json)?;

    println!("Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  orch run --file {} --vars '{{\"owner\": \"me\"}}'", output.display());
    Ok(())
}
