// src/queue.rs
//
// The external collaborator contract (spec §6). The supervisor core only
// ever talks to the queue through this trait — it never assumes Redis, a
// network round trip, or any particular backing store.

use crate::task::Task;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub struct QueueError(pub String);

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue error: {}", self.0)
    }
}

impl std::error::Error for QueueError {}

/// Default interval a supervisor should wait between empty `dequeue` polls
/// when the queue implementation does not itself block.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Narrow contract a supervisor needs from the task queue: dequeue to start
/// work, and exactly one of `release`/`requeue` to end it. `enqueue` exists
/// for completeness and test setup; the supervisor core never calls it.
#[cfg_attr(test, mockall::automock)]
pub trait Queue: Send + Sync {
    /// Returns the next available task, or `None` if the queue is currently
    /// empty. Must not block longer than the queue's own internal polling
    /// cadence.
    fn dequeue(&self) -> Result<Option<Task>, QueueError>;

    /// Appends a task to the queue. Not used by the supervisor core; kept
    /// for producers and test fixtures.
    fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Returns `task` to the pending set for another attempt. Must be
    /// idempotent.
    fn requeue(&self, task: &Task) -> Result<(), QueueError>;

    /// Removes `task` from the in-flight set. Must tolerate being called
    /// twice for the same task id.
    fn release(&self, task: &Task) -> Result<(), QueueError>;
}
