//! Built-in task library
//!
//! Task types every orchestrator deployment ships with. Each type comes as a
//! catalog entry for the [`TaskRegistry`] and a handler for the [`TaskQueue`].

mod debug;
mod time;
mod transform;
mod window;

pub use debug::{DebugTask, DebugTaskDefinition};
pub use time::{DelayTask, DelayTaskDefinition};
pub use transform::{JsonParseTask, JsonParseTaskDefinition, JsonStringifyTask, JsonStringifyTaskDefinition};
pub use window::{WindowResolveTask, WindowResolveTaskDefinition, TIME_WINDOW_VAR};

use orchcore::WorkflowError;
use orchruntime::{TaskQueue, TaskRegistry};
use std::sync::Arc;

/// Register all built-in tasks with a registry and define their handlers on `queue`
pub fn register_all(registry: &mut TaskRegistry, queue: &dyn TaskQueue) -> Result<(), WorkflowError> {
    registry.register(Arc::new(DebugTaskDefinition))?;
    queue.define("debug.log", Arc::new(DebugTask));

    registry.register(Arc::new(DelayTaskDefinition))?;
    queue.define("time.delay", Arc::new(DelayTask));

    registry.register(Arc::new(JsonParseTaskDefinition))?;
    queue.define("transform.json_parse", Arc::new(JsonParseTask));

    registry.register(Arc::new(JsonStringifyTaskDefinition))?;
    queue.define("transform.json_stringify", Arc::new(JsonStringifyTask));

    registry.register(Arc::new(WindowResolveTaskDefinition))?;
    queue.define("window.resolve", Arc::new(WindowResolveTask));

    Ok(())
}
