// src/supervisor.rs
//
// The common contract shared by both supervisor variants: callback types,
// the kill-escalation primitive, and the deadline bookkeeping the monitor
// loops in per_task.rs and persistent.rs both need.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

use crate::log;
use crate::logger::LogLevel;
use crate::task::Task;

/// Invoked after a task completes without error. Best-effort: a panic or
/// error returned from this closure is logged and swallowed, never
/// propagated to the monitor loop.
pub type SuccessHandler = dyn Fn(&Task) + Send + Sync;

/// Invoked on task failure. `exit_status` is `None` for an in-process
/// failure (the registry lookup or the task body itself failed) or
/// `Some(signal)` when the child was killed by that signal.
pub type ErrorHandler = dyn Fn(&Task, Option<i32>, Option<&str>) + Send + Sync;

pub(crate) fn invoke_success(handler: &SuccessHandler, task: &Task) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
    if result.is_err() {
        log!(LogLevel::Error, "success_handler panicked for task {}", task.id);
    }
}

pub(crate) fn invoke_error(
    handler: &ErrorHandler,
    task: &Task,
    exit_status: Option<i32>,
    exc_info: Option<&str>,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler(task, exit_status, exc_info)
    }));
    if result.is_err() {
        log!(LogLevel::Error, "error_handler panicked for task {}", task.id);
    }
}

/// The deadline pair a monitor loop tracks for one in-flight task: the
/// point past which the child should be sent `SIGTERM`, and the later
/// point past which it should be sent `SIGKILL`.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub term_at: Instant,
    pub kill_at: Instant,
}

impl Deadlines {
    pub fn new(timeout: Duration, kill_timeout: Duration) -> Deadlines {
        let now = Instant::now();
        Deadlines {
            term_at: now + timeout,
            kill_at: now + timeout + kill_timeout,
        }
    }
}

/// Escalation state for a single monitored child: whether `SIGTERM` has
/// already been sent, so the loop only sends it once before moving on to
/// `SIGKILL`.
#[derive(Debug, Default)]
pub struct Escalation {
    term_sent: bool,
}

impl Escalation {
    pub fn new() -> Escalation {
        Escalation::default()
    }

    /// Checks `deadlines` against `now` and sends the appropriate signal to
    /// `pid` if a boundary has been crossed. Idempotent: `SIGTERM` is only
    /// ever sent once.
    pub fn tick(&mut self, pid: Pid, deadlines: &Deadlines, now: Instant) {
        if now >= deadlines.kill_at {
            send_signal(pid, Signal::SIGKILL, "deadline + kill_timeout elapsed");
        } else if !self.term_sent && now >= deadlines.term_at {
            send_signal(pid, Signal::SIGTERM, "deadline elapsed");
            self.term_sent = true;
        }
    }
}

fn send_signal(pid: Pid, signal: Signal, reason: &str) {
    match nix::sys::signal::kill(pid, signal) {
        Ok(()) => {
            log!(LogLevel::Warn, "sent {:?} to pid {} ({})", signal, pid, reason);
        }
        Err(nix::errno::Errno::ESRCH) => {
            log!(LogLevel::Trace, "pid {} already gone, skipping {:?}", pid, signal);
        }
        Err(e) => {
            log!(LogLevel::Warn, "failed to send {:?} to pid {}: {}", signal, pid, e);
        }
    }
}

/// Classifies a `waitpid` outcome into the task-outcome taxonomy: `Ok(None)`
/// means the child is still alive (spurious wake, caller should keep
/// waiting); `Ok(Some(outcome))` means it has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with status 0: success.
    Success,
    /// Exited with a nonzero status and no signal: died before the task ran.
    FailedBeforeExecution,
    /// Killed by a signal.
    Signaled(i32),
}

pub fn classify_wait(status: WaitStatus) -> Option<ExitOutcome> {
    match status {
        WaitStatus::Exited(_, 0) => Some(ExitOutcome::Success),
        WaitStatus::Exited(_, _) => Some(ExitOutcome::FailedBeforeExecution),
        WaitStatus::Signaled(_, signal, _) => Some(ExitOutcome::Signaled(signal as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_sends_term_then_kill_once_each() {
        // pid 1 always exists but signals to it are expected to fail with
        // EPERM in test sandboxes; this only exercises the decision logic,
        // not delivery, so ESRCH/EPERM are both fine outcomes here. Using
        // our own pid here would actually deliver the signal to the test
        // process itself.
        let pid = Pid::from_raw(1);
        let deadlines = Deadlines {
            term_at: Instant::now() - Duration::from_millis(1),
            kill_at: Instant::now() + Duration::from_secs(60),
        };
        let mut escalation = Escalation::new();
        assert!(!escalation.term_sent);
        escalation.tick(pid, &deadlines, Instant::now());
        assert!(escalation.term_sent);
    }

    #[test]
    fn classify_wait_maps_exit_codes() {
        assert_eq!(
            classify_wait(WaitStatus::Exited(Pid::from_raw(1), 0)),
            Some(ExitOutcome::Success)
        );
        assert_eq!(
            classify_wait(WaitStatus::Exited(Pid::from_raw(1), 1)),
            Some(ExitOutcome::FailedBeforeExecution)
        );
    }
}
