#[cfg(test)]
mod tests {
    use crate::queue::MockQueue;
    use crate::task::{Task, TaskRegistry};
    use crate::PersistentSupervisor;
    use serial_test::serial;
    use std::fs;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Handler-side effects (success_handler, queue.release) run inside the
    /// forked child's own copy of process memory, so an in-process counter
    /// in the test can never observe them. The reference worker's own test
    /// suite works around this by watching pid stability through a side
    /// channel; this does the same with a plain file, one pid-per-line per
    /// completed task.
    fn pid_log_path() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("delayed_worker_reuse_test_{}.log", std::process::id()));
        path
    }

    #[test]
    #[serial]
    fn three_tasks_share_a_single_forked_child() {
        let log_path = pid_log_path();
        let _ = fs::remove_file(&log_path);

        let tasks: Vec<Task> = vec![
            Task::new(1, "add", serde_json::json!([1, 2]), None, 0),
            Task::new(2, "add", serde_json::json!([3, 4]), None, 0),
            Task::new(3, "add", serde_json::json!([5, 6]), None, 0),
        ];
        let remaining = Mutex::new(tasks.into_iter());

        let mut mock = MockQueue::new();
        mock.expect_dequeue().returning(move || Ok(remaining.lock().unwrap().next()));
        mock.expect_release().returning(|_| Ok(()));

        let log_path_for_handler = log_path.clone();
        let registry = TaskRegistry::builder()
            .register("add", move |_args| {
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path_for_handler)
                    .expect("open pid log");
                writeln!(file, "{}", std::process::id()).expect("append pid log");
                Ok(())
            })
            .build();

        let supervisor = Arc::new(PersistentSupervisor::new(
            Arc::new(mock),
            Arc::new(registry),
            crate::config::SupervisorConfig::default(),
            Arc::new(|_task| {}),
            Arc::new(|_task, _status, _exc| {}),
        ));

        let runner = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.run())
        };

        let start = Instant::now();
        let completed = |path: &std::path::Path| -> usize {
            fs::read_to_string(path)
                .map(|s| s.lines().filter(|l| !l.is_empty()).count())
                .unwrap_or(0)
        };
        while completed(&log_path) < 3 && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(20));
        }

        supervisor.stop();
        let _ = runner.join();

        let contents = fs::read_to_string(&log_path).expect("pid log should exist");
        let pids: std::collections::HashSet<&str> =
            contents.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(pids.len(), 1, "all three tasks should run in the same forked child");

        let _ = fs::remove_file(&log_path);
    }
}
