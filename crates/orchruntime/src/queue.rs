//! Transport between the orchestrator and task handlers.
//!
//! The engine only needs to hand off `(taskType, params)` and get back an
//! outcome. `LocalTaskQueue` runs handlers in-process; a queue backed by an
//! external job store implements the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchcore::{JobId, NodeError, TaskHandler, TaskInvocation};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Install the handler that processes jobs of `task_type`
    fn define(&self, task_type: &str, handler: Arc<dyn TaskHandler>);

    /// Submit a job and wait for its outcome
    async fn enqueue(&self, invocation: TaskInvocation) -> Result<Value, NodeError>;

    /// Keepalive for a running job; false if the job is unknown or finished
    fn touch(&self, job_id: JobId) -> bool;

    /// Jobs currently in flight
    fn active_jobs(&self) -> Vec<ActiveJob>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub task_type: String,
    pub node_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// In-process queue: jobs run on the caller's task
#[derive(Default)]
pub struct LocalTaskQueue {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    jobs: Arc<RwLock<HashMap<JobId, ActiveJob>>>,
}

impl LocalTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defined_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Removes the job from the active set however `enqueue` exits
struct JobGuard {
    job_id: JobId,
    jobs: Arc<RwLock<HashMap<JobId, ActiveJob>>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.remove(&self.job_id);
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    fn define(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        tracing::info!("Defining handler for task type: {}", task_type);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(task_type.to_string(), handler);
    }

    async fn enqueue(&self, invocation: TaskInvocation) -> Result<Value, NodeError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&invocation.task_type)
            .cloned();
        let handler = handler.ok_or_else(|| {
            NodeError::ExecutionFailed(format!(
                "no handler defined for task type '{}'",
                invocation.task_type
            ))
        })?;

        let now = Utc::now();
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            jobs.insert(
                invocation.job_id,
                ActiveJob {
                    job_id: invocation.job_id,
                    task_type: invocation.task_type.clone(),
                    node_id: invocation.node_id.clone(),
                    enqueued_at: now,
                    last_heartbeat: now,
                },
            );
        }
        let _guard = JobGuard {
            job_id: invocation.job_id,
            jobs: self.jobs.clone(),
        };

        handler.handle(invocation).await
    }

    fn touch(&self, job_id: JobId) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    fn active_jobs(&self) -> Vec<ActiveJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.values().cloned().collect()
    }
}
