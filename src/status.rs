// src/status.rs
//
// The supervisor's own lifecycle state machine (spec: "Worker status").

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::Stopped,
            1 => WorkerStatus::Running,
            _ => WorkerStatus::Stopping,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerStatus::Stopped => 0,
            WorkerStatus::Running => 1,
            WorkerStatus::Stopping => 2,
        }
    }
}

/// Atomic holder for `WorkerStatus`, safe to read from a signal handler's
/// `stop()` call (a single relaxed store) and from the main monitor loop.
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(initial: WorkerStatus) -> StatusCell {
        StatusCell(AtomicU8::new(initial.as_u8()))
    }

    pub fn get(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: WorkerStatus) {
        self.0.store(status.as_u8(), Ordering::SeqCst);
    }

    /// `Running → Stopping`, the only transition `stop()` is allowed to make.
    /// A no-op if not currently `Running` (covers the already-stopping and
    /// already-stopped cases without extra branching at call sites).
    pub fn request_stop(&self) {
        let _ = self.0.compare_exchange(
            WorkerStatus::Running.as_u8(),
            WorkerStatus::Stopping.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        StatusCell::new(WorkerStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_stop_only_applies_while_running() {
        let cell = StatusCell::new(WorkerStatus::Stopped);
        cell.request_stop();
        assert_eq!(cell.get(), WorkerStatus::Stopped);

        cell.set(WorkerStatus::Running);
        cell.request_stop();
        assert_eq!(cell.get(), WorkerStatus::Stopping);
    }
}
