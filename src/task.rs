// src/task.rs
//
// The data model (spec §3) and the callable registry this implementation
// uses to resolve `TaskSpec.func` at runtime (spec §3a). The supervisor core
// (supervisor.rs, per_task.rs, persistent.rs) only ever touches `Task::id`,
// `Task::data`, `Task::timeout`, `Task::retry`, `Task::run` and
// `Task::deserialize` — it never parses `TaskSpec` itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{general, ErrorArrayItem};

/// The wire payload carried inside `Task::data`. A supplementary, swappable
/// format — nothing outside this module is allowed to depend on its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: u64,
    pub func: String,
    pub args: Value,
    pub timeout_ms: Option<u64>,
    pub retry: u32,
}

/// A dequeued unit of work. `data` is opaque to everything except
/// `TaskSpec`/`TaskRegistry`; the supervisor forwards it and measures its
/// length only.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub data: Vec<u8>,
    pub timeout: Option<Duration>,
    pub retry: u32,
}

/// Mirrors the source system's `exit_status`/`exc_info` pair: `None` means an
/// in-process failure (the task body raised/returned an error), `Some(sig)`
/// means the child was killed by that signal.
#[derive(Debug)]
pub enum TaskError {
    /// The registered handler itself failed.
    Handler(String),
    /// `data` did not parse as a `TaskSpec`.
    Deserialize(String),
    /// `TaskSpec.func` has no registered handler.
    UnknownFunction(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Handler(msg) => write!(f, "task handler failed: {msg}"),
            TaskError::Deserialize(msg) => write!(f, "task payload deserialize failed: {msg}"),
            TaskError::UnknownFunction(name) => write!(f, "no handler registered for '{name}'"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<TaskError> for ErrorArrayItem {
    fn from(err: TaskError) -> Self {
        general(err.to_string())
    }
}

impl Task {
    pub fn new(id: u64, func: &str, args: Value, timeout: Option<Duration>, retry: u32) -> Task {
        let spec = TaskSpec {
            id,
            func: func.to_owned(),
            args,
            timeout_ms: timeout.map(|d| d.as_millis() as u64),
            retry,
        };
        // A `TaskSpec` built from well-formed inputs always serializes.
        let data = serde_json::to_vec(&spec).expect("TaskSpec serialization is infallible");
        Task {
            id,
            data,
            timeout,
            retry,
        }
    }

    /// Reconstructs a full `Task` envelope from raw bytes. Used by the
    /// persistent-child's dispatch loop, which never inherited the original
    /// in-process value the way a `fork()`ed per-task child does — it only
    /// has what came down the wire.
    pub fn deserialize(data: &[u8]) -> Result<Task, TaskError> {
        let spec: TaskSpec =
            serde_json::from_slice(data).map_err(|e| TaskError::Deserialize(e.to_string()))?;
        Ok(Task {
            id: spec.id,
            data: data.to_vec(),
            timeout: spec.timeout_ms.map(Duration::from_millis),
            retry: spec.retry,
        })
    }

    /// Runs this task in-process, looking up its handler in `registry`.
    pub fn run(&self, registry: &TaskRegistry) -> Result<(), TaskError> {
        let spec: TaskSpec = serde_json::from_slice(&self.data)
            .map_err(|e| TaskError::Deserialize(e.to_string()))?;
        registry.invoke(&spec.func, &spec.args)
    }
}

type Handler = dyn Fn(&Value) -> Result<(), TaskError> + Send + Sync;

/// A startup-populated table mapping `TaskSpec.func` names to handlers. This
/// is the "registry mapping string keys to function pointers" option the
/// spec's design notes leave open (§3a, §9).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<Handler>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn invoke(&self, func: &str, args: &Value) -> Result<(), TaskError> {
        match self.handlers.get(func) {
            Some(handler) => handler(args),
            None => Err(TaskError::UnknownFunction(func.to_owned())),
        }
    }

}

pub struct TaskRegistryBuilder {
    handlers: HashMap<String, Arc<Handler>>,
}

impl TaskRegistryBuilder {
    pub fn register<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_owned(), Arc::new(handler));
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_data() {
        let task = Task::new(7, "add", serde_json::json!([1, 2]), None, 0);
        let again = Task::deserialize(&task.data).unwrap();
        assert_eq!(again.id, 7);
        assert_eq!(again.data, task.data);
    }

    #[test]
    fn run_invokes_registered_handler() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static CALLED: AtomicBool = AtomicBool::new(false);

        let registry = TaskRegistry::builder()
            .register("noop", |_args| {
                CALLED.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build();

        let task = Task::new(1, "noop", Value::Null, None, 0);
        task.run(&registry).unwrap();
        assert!(CALLED.load(Ordering::SeqCst));
    }

    #[test]
    fn run_reports_unknown_function() {
        let registry = TaskRegistry::builder().build();
        let task = Task::new(1, "missing", Value::Null, None, 0);
        let err = task.run(&registry).unwrap_err();
        assert!(matches!(err, TaskError::UnknownFunction(name) if name == "missing"));
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let err = Task::deserialize(b"not json").unwrap_err();
        assert!(matches!(err, TaskError::Deserialize(_)));
    }
}
