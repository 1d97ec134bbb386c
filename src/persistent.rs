// src/persistent.rs
//
// The persistent-child supervisor (spec §4.3): forks a child once and
// reuses it across many tasks by streaming framed payloads over a pipe,
// respawning only when the child dies.

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SupervisorConfig;
use crate::error::ErrorArrayItem;
use crate::framing::{
    self, close_fd, new_nonblocking_pipe, poll_fd, read_result_byte, write_frame, FrameError,
    RESULT_FAILURE, RESULT_SUCCESS,
};
use crate::log;
use crate::logger::LogLevel;
use crate::queue::Queue;
use crate::status::{StatusCell, WorkerStatus};
use crate::supervisor::{classify_wait, invoke_error, invoke_success, Deadlines, Escalation, ErrorHandler, ExitOutcome, SuccessHandler};
use crate::task::{Task, TaskRegistry};
use crate::waker::{self, Waker};

/// The parent-side handle to a live persistent child: its pid and the two
/// pipe ends it owns (task-channel write end, result-channel read end).
struct ChildSlot {
    pid: Pid,
    task_write_fd: RawFd,
    result_read_fd: RawFd,
}

impl Drop for ChildSlot {
    fn drop(&mut self) {
        close_fd(self.task_write_fd);
        close_fd(self.result_read_fd);
    }
}

pub struct PersistentSupervisor {
    queue: Arc<dyn Queue>,
    registry: Arc<TaskRegistry>,
    config: SupervisorConfig,
    success_handler: Arc<SuccessHandler>,
    error_handler: Arc<ErrorHandler>,
    status: StatusCell,
}

impl PersistentSupervisor {
    pub fn new(
        queue: Arc<dyn Queue>,
        registry: Arc<TaskRegistry>,
        config: SupervisorConfig,
        success_handler: Arc<SuccessHandler>,
        error_handler: Arc<ErrorHandler>,
    ) -> PersistentSupervisor {
        PersistentSupervisor {
            queue,
            registry,
            config,
            success_handler,
            error_handler,
            status: StatusCell::new(WorkerStatus::Stopped),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    pub fn stop(&self) {
        self.status.request_stop();
    }

    pub fn run(&self) -> Result<(), ErrorArrayItem> {
        self.status.set(WorkerStatus::Running);
        let waker = Waker::install()?;
        let mut child: Option<ChildSlot> = None;

        while self.status.get() == WorkerStatus::Running {
            waker.apply_pending_stop(&self.status);
            if self.status.get() != WorkerStatus::Running {
                break;
            }

            let task = match self.queue.dequeue() {
                Ok(Some(task)) => task,
                Ok(None) => {
                    std::thread::sleep(crate::queue::DEFAULT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    log!(LogLevel::Error, "dequeue failed: {}", e);
                    std::thread::sleep(crate::queue::DEFAULT_POLL_INTERVAL);
                    continue;
                }
            };

            if child.is_none() {
                match self.spawn_child() {
                    Ok(slot) => child = Some(slot),
                    Err(e) => {
                        log!(LogLevel::Error, "failed to spawn persistent child: {}", e);
                        let _ = self.queue.requeue(&task);
                        continue;
                    }
                }
            }

            let slot = child.as_ref().expect("child slot populated above");
            if !self.dispatch_and_monitor(&task, slot, &waker) {
                // Child died or the channel broke; drop it so the next
                // iteration respawns.
                child = None;
            }
        }

        drop(child);
        self.status.set(WorkerStatus::Stopped);
        Ok(())
    }

    fn spawn_child(&self) -> Result<ChildSlot, ErrorArrayItem> {
        let (task_read_fd, task_write_fd) = new_nonblocking_pipe()?;
        let (result_read_fd, result_write_fd) = new_nonblocking_pipe()?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                close_fd(task_write_fd);
                close_fd(result_read_fd);
                waker::reset_to_default(libc::SIGHUP);
                waker::reset_to_default(libc::SIGCHLD);
                let code = run_tasks(
                    task_read_fd,
                    result_write_fd,
                    &self.registry,
                    &self.queue,
                    &self.success_handler,
                    &self.error_handler,
                    self.config.poll_interval(),
                );
                unsafe { libc::_exit(code) };
            }
            Ok(ForkResult::Parent { child }) => {
                close_fd(task_read_fd);
                close_fd(result_write_fd);
                log!(LogLevel::Debug, "forked persistent child {}", child);
                Ok(ChildSlot {
                    pid: child,
                    task_write_fd,
                    result_read_fd,
                })
            }
            Err(e) => {
                close_fd(task_read_fd);
                close_fd(task_write_fd);
                close_fd(result_read_fd);
                close_fd(result_write_fd);
                Err(crate::error::general(format!("fork() failed: {e}")))
            }
        }
    }

    /// Dispatches `task` to the child in `slot` and monitors it to
    /// completion. Returns `true` if the child is still usable for the next
    /// task, `false` if it died and must be respawned.
    fn dispatch_and_monitor(&self, task: &Task, slot: &ChildSlot, waker: &Waker) -> bool {
        let timeout = task.timeout.unwrap_or_else(|| self.config.default_timeout());
        let send_deadline = Instant::now() + self.config.send_budget(timeout);

        if let Err(e) = write_frame(slot.task_write_fd, &task.data, send_deadline) {
            log!(LogLevel::Error, "dispatch to child {} failed: {:?}", slot.pid, e);
            self.kill_and_reap(slot.pid);
            let _ = self.queue.requeue(task);
            return false;
        }

        self.monitor_dispatch(task, slot, waker, timeout)
    }

    fn monitor_dispatch(&self, task: &Task, slot: &ChildSlot, waker: &Waker, timeout: std::time::Duration) -> bool {
        let deadlines = Deadlines::new(timeout, self.config.kill_timeout());
        let mut escalation = Escalation::new();
        let poll_interval = self.config.poll_interval();

        loop {
            let waker_ready = poll_fd(waker.read_fd(), false, poll_interval).unwrap_or(false);
            if waker_ready {
                waker.drain();
                match waitpid(slot.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(status) => {
                        if let Some(outcome) = classify_wait(status) {
                            self.finish_dispatch(task, outcome);
                            return false;
                        }
                    }
                    Err(e) => {
                        log!(LogLevel::Error, "waitpid failed for pid {}: {}", slot.pid, e);
                    }
                }
            }

            match read_result_byte(slot.result_read_fd) {
                Ok(Some(Some(_byte))) => {
                    // Handler + release already happened inside the child;
                    // the byte itself is diagnostic only.
                    return true;
                }
                Ok(Some(None)) => {
                    // EOF: child exited between writing a result and the
                    // next frame. The waker will observe the exit on its
                    // next wake; keep polling.
                }
                Ok(None) => {}
                Err(e) => {
                    log!(LogLevel::Error, "result channel read failed: {}", e);
                }
            }

            escalation.tick(slot.pid, &deadlines, Instant::now());
        }
    }

    fn finish_dispatch(&self, task: &Task, outcome: ExitOutcome) {
        match outcome {
            ExitOutcome::Success => {}
            ExitOutcome::Signaled(signal) => {
                if signal != 0 {
                    invoke_error(&*self.error_handler, task, Some(signal), None);
                }
                if let Err(e) = self.queue.release(task) {
                    log!(LogLevel::Error, "release failed for task {}: {}", task.id, e);
                }
            }
            ExitOutcome::FailedBeforeExecution => {
                if let Err(e) = self.queue.requeue(task) {
                    log!(LogLevel::Error, "requeue failed for task {}: {}", task.id, e);
                }
            }
        }
    }

    fn kill_and_reap(&self, pid: Pid) {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}

/// The child-side dispatch loop (`run_tasks`): reads framed tasks off
/// `task_read_fd` until the channel breaks, running each through `registry`
/// and writing one result byte per completed frame to `result_write_fd`.
fn run_tasks(
    task_read_fd: RawFd,
    result_write_fd: RawFd,
    registry: &TaskRegistry,
    queue: &Arc<dyn Queue>,
    success_handler: &SuccessHandler,
    error_handler: &ErrorHandler,
    poll_interval: std::time::Duration,
) -> i32 {
    loop {
        let frame = match framing::read_frame(task_read_fd, poll_interval) {
            Ok(bytes) => bytes,
            Err(FrameError::ChannelBroken) => {
                let _ = framing::write_result_byte(result_write_fd, RESULT_FAILURE);
                return 1;
            }
            Err(e) => {
                log!(LogLevel::Error, "frame read failed: {:?}", e);
                let _ = framing::write_result_byte(result_write_fd, RESULT_FAILURE);
                return 1;
            }
        };

        // Mirrors the source worker's `error_code = 0` set the moment
        // deserialization succeeds and never reset afterward: once a task
        // has reached execution, a failed result-byte write (parent gone)
        // exits 0, even if the task itself failed. `result_byte` only ever
        // governs what's reported to the parent, never the exit code.
        let mut reached_execution = false;
        let result_byte = match Task::deserialize(&frame) {
            Err(e) => {
                log!(LogLevel::Error, "task deserialize failed: {}", e);
                RESULT_FAILURE
            }
            Ok(task) => {
                reached_execution = true;
                match task.run(registry) {
                    Ok(()) => {
                        let _ = queue.release(&task);
                        invoke_success(success_handler, &task);
                        RESULT_SUCCESS
                    }
                    Err(e) => {
                        let _ = queue.release(&task);
                        invoke_error(error_handler, &task, None, Some(&e.to_string()));
                        RESULT_FAILURE
                    }
                }
            }
        };

        if framing::write_result_byte(result_write_fd, result_byte).is_err() {
            // Parent is gone; nothing left to report to.
            return if reached_execution { 0 } else { 1 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockQueue;
    use serde_json::Value;

    #[test]
    fn run_tasks_reports_deserialize_failure_without_crashing() {
        let (task_read, task_write) = new_nonblocking_pipe().unwrap();
        let (result_read, result_write) = new_nonblocking_pipe().unwrap();

        let writer = std::thread::spawn(move || {
            framing::write_frame(task_write, b"not json", Instant::now() + std::time::Duration::from_secs(1)).unwrap();
            close_fd(task_write);
        });

        let mock = MockQueue::new();
        let queue: Arc<dyn Queue> = Arc::new(mock);
        let registry = TaskRegistry::builder().build();

        let handle = std::thread::spawn(move || {
            run_tasks(
                task_read,
                result_write,
                &registry,
                &queue,
                &|_task| {},
                &|_task, _status, _exc| {},
                std::time::Duration::from_millis(50),
            )
        });

        writer.join().unwrap();
        let code = handle.join().unwrap();
        assert_eq!(code, 1);

        let byte = read_result_byte(result_read).unwrap();
        assert_eq!(byte, Some(Some(RESULT_FAILURE)));
        close_fd(task_read);
        close_fd(result_read);
    }

    #[test]
    fn run_tasks_releases_and_reports_success() {
        let (task_read, task_write) = new_nonblocking_pipe().unwrap();
        let (result_read, result_write) = new_nonblocking_pipe().unwrap();

        let task = Task::new(42, "noop", Value::Null, None, 0);
        let data = task.data.clone();

        let writer = std::thread::spawn(move || {
            framing::write_frame(task_write, &data, Instant::now() + std::time::Duration::from_secs(1)).unwrap();
            close_fd(task_write);
        });

        let mut mock = MockQueue::new();
        mock.expect_release().times(1).returning(|_| Ok(()));
        let queue: Arc<dyn Queue> = Arc::new(mock);
        let registry = TaskRegistry::builder().register("noop", |_args| Ok(())).build();

        let handle = std::thread::spawn(move || {
            run_tasks(
                task_read,
                result_write,
                &registry,
                &queue,
                &|_task| {},
                &|_task, _status, _exc| {},
                std::time::Duration::from_millis(50),
            )
        });

        writer.join().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let byte = read_result_byte(result_read).unwrap();
        assert_eq!(byte, Some(Some(RESULT_SUCCESS)));

        // task_write is already closed, so the next read_frame in the loop
        // observes EOF and the child loop exits on its own.
        let _ = handle.join().unwrap();
        close_fd(task_read);
        close_fd(result_read);
    }
}
