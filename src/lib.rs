// Fork-based supervision for a distributed delayed-task queue.
pub mod config;
pub mod error;
pub mod framing;
pub mod logger;
pub mod per_task;
pub mod persistent;
pub mod queue;
pub mod status;
pub mod supervisor;
pub mod task;
pub mod waker;

pub use per_task::PerTaskSupervisor;
pub use persistent::PersistentSupervisor;
pub use queue::{Queue, QueueError};
pub use status::WorkerStatus;
pub use supervisor::{ErrorHandler, SuccessHandler};
pub use task::{Task, TaskError, TaskRegistry, TaskSpec};

// tests
#[path = "../src/tests/timeout_escalation_test.rs"]
mod timeout_escalation_test;

#[path = "../src/tests/persistent_reuse_test.rs"]
mod persistent_reuse_test;

#[path = "../src/tests/lifecycle_accounting_test.rs"]
mod lifecycle_accounting_test;
