//! Per-execution event streams.
//!
//! Every active execution owns a broadcast channel. The channel is opened
//! before the scheduler starts and closed right after the terminal event is
//! sent, under the same lock, so a subscriber either receives the terminal
//! event live or finds no channel and falls back to the stored record.

use orchcore::{
    ExecutionEvent, ExecutionEventType, ExecutionId, ExecutionStatus, WorkflowExecution,
};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub struct EventBus {
    capacity: usize,
    channels: RwLock<HashMap<ExecutionId, broadcast::Sender<ExecutionEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open the channel of a new execution and return its emitter
    pub fn open(&self, execution_id: ExecutionId) -> EventEmitter {
        let (sender, _) = broadcast::channel(self.capacity);
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.insert(execution_id, sender.clone());
        EventEmitter {
            execution_id,
            sender,
        }
    }

    /// Live subscription, or `None` once the execution has no open channel
    pub fn subscribe(&self, execution_id: ExecutionId) -> Option<Subscription> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(&execution_id).map(|sender| Subscription {
            execution_id,
            receiver: Some(sender.subscribe()),
            replay: None,
            done: false,
        })
    }

    /// Send the terminal event and close the channel
    pub fn finish(&self, event: ExecutionEvent) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.remove(&event.execution_id) {
            let _ = sender.send(event);
        }
    }

    pub fn is_open(&self, execution_id: ExecutionId) -> bool {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.contains_key(&execution_id)
    }
}

/// Sending half handed to the scheduler of one execution
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Nobody listening is fine
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

/// Stream of events for one execution. Ends after the terminal event.
/// Dropping it unsubscribes without touching the run.
pub struct Subscription {
    execution_id: ExecutionId,
    receiver: Option<broadcast::Receiver<ExecutionEvent>>,
    replay: Option<ExecutionEvent>,
    done: bool,
}

impl Subscription {
    /// Subscription to an execution that already finished: yields its
    /// terminal event once
    pub fn finished(event: ExecutionEvent) -> Self {
        Self {
            execution_id: event.execution_id,
            receiver: None,
            replay: Some(event),
            done: false,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        if self.done {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.done = true;
            return Some(event);
        }
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Subscriber of execution {} lagged, skipped {} events",
                        self.execution_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

/// Terminal event describing a finished record, `None` while it still runs
pub fn terminal_event(record: &WorkflowExecution) -> Option<ExecutionEvent> {
    let event_type = match record.status {
        ExecutionStatus::Running => return None,
        ExecutionStatus::Success => ExecutionEventType::ExecutionCompleted,
        ExecutionStatus::Failed => ExecutionEventType::ExecutionFailed,
        ExecutionStatus::Cancelled => ExecutionEventType::ExecutionCancelled,
    };
    Some(ExecutionEvent::execution(
        event_type,
        record.execution_id,
        record.error.clone(),
    ))
}
