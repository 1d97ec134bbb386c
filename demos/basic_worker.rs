//! Runs a handful of tasks through an in-memory queue using the per-task
//! supervisor, to show the library's public surface end to end.

use delayed_worker::config::SupervisorConfig;
use delayed_worker::queue::{Queue, QueueError};
use delayed_worker::task::{Task, TaskRegistry};
use delayed_worker::PerTaskSupervisor;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A minimal `Queue` backed by an in-process `VecDeque`, useful for demos
/// and local experimentation. Not suitable for multi-process deployments —
/// each forked child only sees its own copy.
struct InMemoryQueue {
    pending: Mutex<VecDeque<Task>>,
}

impl InMemoryQueue {
    fn new(tasks: Vec<Task>) -> InMemoryQueue {
        InMemoryQueue {
            pending: Mutex::new(tasks.into()),
        }
    }
}

impl Queue for InMemoryQueue {
    fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        Ok(self.pending.lock().unwrap().pop_front())
    }

    fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.pending.lock().unwrap().push_back(task);
        Ok(())
    }

    fn requeue(&self, task: &Task) -> Result<(), QueueError> {
        self.pending.lock().unwrap().push_back(task.clone());
        Ok(())
    }

    fn release(&self, _task: &Task) -> Result<(), QueueError> {
        Ok(())
    }
}

fn main() {
    let tasks = vec![
        Task::new(1, "add", json!([1, 2]), None, 0),
        Task::new(2, "add", json!([10, 20]), None, 0),
        Task::new(3, "fail", json!(null), None, 0),
    ];
    let queue = Arc::new(InMemoryQueue::new(tasks));

    let registry = TaskRegistry::builder()
        .register("add", |args| {
            let values: Vec<i64> = serde_json::from_value(args.clone()).unwrap_or_default();
            println!("add -> {}", values.iter().sum::<i64>());
            Ok(())
        })
        .register("fail", |_args| {
            Err(delayed_worker::TaskError::Handler("simulated failure".into()))
        })
        .build();

    let supervisor = Arc::new(PerTaskSupervisor::new(
        queue,
        Arc::new(registry),
        SupervisorConfig::default(),
        Arc::new(|task| println!("task {} succeeded", task.id)),
        Arc::new(|task, status, exc| {
            println!("task {} failed (status={:?}, exc={:?})", task.id, status, exc)
        }),
    ));

    let runner = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };

    thread::sleep(Duration::from_millis(500));
    supervisor.stop();
    runner.join().unwrap().expect("supervisor run failed");
}
