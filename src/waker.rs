// src/waker.rs
//
// The self-pipe pattern (spec §5/§4.4): SIGHUP and SIGCHLD handlers that do
// nothing but write one byte to a pipe, so the monitor loop's poll() is the
// only place signal state is actually acted on.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::{os_error, ErrorArrayItem};
use crate::framing::{close_fd, new_nonblocking_pipe};
use crate::status::StatusCell;

// The write end of the self-pipe, touched only from inside the signal
// handler via a raw, async-signal-safe `write()` call. `-1` means "not
// installed".
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

// Set by the SIGHUP handler; `stop()`'s only job from a signal context.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
    wake();
}

extern "C" fn on_sigchld(_signum: libc::c_int) {
    wake();
}

fn wake() {
    let fd = WAKE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs `SIGHUP`/`SIGCHLD` handlers and creates the self-pipe. Dropping
/// the returned guard restores the previous handlers and closes the pipe.
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
    prev_sighup: libc::sighandler_t,
    prev_sigchld: libc::sighandler_t,
}

impl Waker {
    pub fn install() -> Result<Waker, ErrorArrayItem> {
        let (read_fd, write_fd) = new_nonblocking_pipe()?;
        WAKE_WRITE_FD.store(write_fd, Ordering::SeqCst);
        STOP_REQUESTED.store(false, Ordering::SeqCst);

        let prev_sighup = install_handler(libc::SIGHUP, on_sighup as usize)?;
        let prev_sigchld = install_handler(libc::SIGCHLD, on_sigchld as usize)?;

        Ok(Waker {
            read_fd,
            write_fd,
            prev_sighup,
            prev_sigchld,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn drain(&self) {
        crate::framing::drain(self.read_fd);
    }

    /// Calls `status.request_stop()` if a `SIGHUP` arrived since the last
    /// call, consuming the flag.
    pub fn apply_pending_stop(&self, status: &StatusCell) {
        if STOP_REQUESTED.swap(false, Ordering::SeqCst) {
            status.request_stop();
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        WAKE_WRITE_FD.store(-1, Ordering::SeqCst);
        restore_handler(libc::SIGHUP, self.prev_sighup);
        restore_handler(libc::SIGCHLD, self.prev_sigchld);
        close_fd(self.read_fd);
        close_fd(self.write_fd);
    }
}

fn install_handler(signum: libc::c_int, handler: usize) -> Result<libc::sighandler_t, ErrorArrayItem> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(signum, &action, &mut previous) };
    if rc != 0 {
        return Err(os_error("sigaction()", nix::errno::Errno::last()));
    }
    Ok(previous.sa_sigaction)
}

fn restore_handler(signum: libc::c_int, previous: libc::sighandler_t) {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = previous;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }
}

/// Clears signal handlers back to default. Called in a freshly-forked child
/// before it runs task code, per spec ("clear signal handlers").
pub fn reset_to_default(signum: libc::c_int) {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }
}
