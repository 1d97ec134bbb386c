// src/framing.rs
//
// Non-blocking pipe primitives and the task/result frame codec (spec §6).
// Built on raw libc calls rather than a pipe-wrapping crate so the exact
// fcntl/poll shapes used here are pinned regardless of which nix version
// ends up resolved.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{os_error, ErrorArrayItem};

/// Default pipe atomic size (`PIPE_BUF` on Linux). A task frame at or under
/// this size is guaranteed to land in one non-blocking `write`.
pub const PIPE_ATOMIC_SIZE: usize = 65536;

const HEADER_LEN: usize = 4;

fn errno() -> nix::errno::Errno {
    nix::errno::Errno::last()
}

fn would_block(errno: nix::errno::Errno) -> bool {
    errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK
}

/// Creates a non-blocking pipe, returning `(read_fd, write_fd)`.
pub fn new_nonblocking_pipe() -> Result<(RawFd, RawFd), ErrorArrayItem> {
    let mut fds: [i32; 2] = [-1, -1];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(os_error("pipe()", errno()));
    }
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), ErrorArrayItem> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(os_error("fcntl(F_GETFL)", errno()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(os_error("fcntl(F_SETFL)", errno()));
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Polls `fd` for readability (or writability) with `timeout`. Returns
/// `true` if the fd became ready, `false` on timeout.
pub fn poll_fd(fd: RawFd, writable: bool, timeout: Duration) -> Result<bool, ErrorArrayItem> {
    let events = if writable { libc::POLLOUT } else { libc::POLLIN };
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let rc = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, timeout_ms) };
    if rc < 0 {
        let e = errno();
        if e == nix::errno::Errno::EINTR {
            return Ok(false);
        }
        return Err(os_error("poll()", e));
    }
    Ok(rc > 0 && (pollfd.revents & events) != 0)
}

/// Drains all currently-available bytes from a non-blocking fd (used on the
/// self-pipe's read end after a wake).
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 256];
    loop {
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc <= 0 {
            break;
        }
    }
}

/// A single non-blocking read attempt. Returns `Ok(0)` on would-block,
/// mirroring a short read rather than erroring, since callers poll first.
pub fn try_read(fd: RawFd, buf: &mut [u8]) -> Result<usize, ErrorArrayItem> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        let e = errno();
        if would_block(e) {
            return Ok(0);
        }
        return Err(os_error("read()", e));
    }
    Ok(rc as usize)
}

/// A single non-blocking write attempt.
pub fn try_write(fd: RawFd, buf: &[u8]) -> Result<usize, ErrorArrayItem> {
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if rc < 0 {
        let e = errno();
        if would_block(e) {
            return Ok(0);
        }
        return Err(os_error("write()", e));
    }
    Ok(rc as usize)
}

#[derive(Debug)]
pub enum FrameError {
    /// Write side: deadline elapsed before the whole frame went out.
    Timeout,
    /// Read side: peer closed or produced a short/zero read mid-frame.
    ChannelBroken,
    Io(ErrorArrayItem),
}

impl From<ErrorArrayItem> for FrameError {
    fn from(e: ErrorArrayItem) -> Self {
        FrameError::Io(e)
    }
}

/// Writes a length-prefixed frame (`data.len()` as 4-byte LE header, then
/// `data`) to `fd`, polling for writability as needed, bounded by
/// `deadline`.
pub fn write_frame(fd: RawFd, data: &[u8], deadline: Instant) -> Result<(), FrameError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    write_all(fd, &buf, deadline)
}

fn write_all(fd: RawFd, buf: &[u8], deadline: Instant) -> Result<(), FrameError> {
    let mut sent = 0usize;
    while sent < buf.len() {
        let now = Instant::now();
        if now >= deadline {
            return Err(FrameError::Timeout);
        }
        let remaining_time = deadline - now;
        let poll_timeout = remaining_time.min(Duration::from_millis(100));
        if !poll_fd(fd, true, poll_timeout)? {
            continue;
        }
        let n = try_write(fd, &buf[sent..])?;
        sent += n;
    }
    Ok(())
}

/// Reads exactly one length-prefixed frame from `fd`, polling for
/// readability as needed. No deadline: callers that need one wrap this in
/// their own monitor loop (the child's own dispatch loop blocks here
/// indefinitely between tasks, per spec).
///
/// The very first read once the fd becomes readable is a single one-shot
/// attempt, not a fill loop: if it yields 4 bytes or fewer, the channel is
/// treated as broken even if more bytes might eventually follow. This
/// mirrors the source worker's `_run_tasks` (`read1` then
/// `if not head_data or len(head_data) <= 4: ... channel is broken`) —
/// later reads, needed only when the header's frame is larger than fit in
/// that first read, use the ordinary fill loop below.
pub fn read_frame(fd: RawFd, poll_timeout: Duration) -> Result<Vec<u8>, FrameError> {
    loop {
        if poll_fd(fd, false, poll_timeout)? {
            break;
        }
    }

    let mut first = vec![0u8; PIPE_ATOMIC_SIZE];
    let n = try_read(fd, &mut first)?;
    if n <= HEADER_LEN {
        return Err(FrameError::ChannelBroken);
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&first[..HEADER_LEN]);
    let len = u32::from_le_bytes(header) as usize;

    let mut body = Vec::with_capacity(len);
    body.extend_from_slice(&first[HEADER_LEN..n]);
    body.truncate(len);
    if body.len() < len {
        let mut rest = vec![0u8; len - body.len()];
        read_exact_blocking(fd, &mut rest, poll_timeout)?;
        body.extend_from_slice(&rest);
    }
    Ok(body)
}

/// Fills the rest of a frame body once the one-shot first read (in
/// `read_frame`) wasn't enough on its own. A zero-byte read here is still
/// treated as broken — the channel can die mid-frame just as easily as on
/// the first read.
fn read_exact_blocking(fd: RawFd, buf: &mut [u8], poll_timeout: Duration) -> Result<(), FrameError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        if !poll_fd(fd, false, poll_timeout)? {
            continue;
        }
        let n = try_read(fd, &mut buf[filled..])?;
        if n == 0 {
            return Err(FrameError::ChannelBroken);
        }
        filled += n;
    }
    Ok(())
}

pub const RESULT_SUCCESS: u8 = b'0';
pub const RESULT_FAILURE: u8 = b'1';

/// Writes a single result byte. Returns `Err` if the write yields zero
/// bytes (parent gone) so the caller can exit immediately per spec.
pub fn write_result_byte(fd: RawFd, byte: u8) -> io::Result<()> {
    let n = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    if n <= 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads a single result byte if available. `Ok(None)` on would-block,
/// `Ok(Some(None))` on EOF (child died), `Ok(Some(Some(byte)))` otherwise.
pub fn read_result_byte(fd: RawFd) -> Result<Option<Option<u8>>, ErrorArrayItem> {
    let mut buf = [0u8; 1];
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
    if rc < 0 {
        let e = errno();
        if would_block(e) {
            return Ok(None);
        }
        return Err(os_error("read()", e));
    }
    if rc == 0 {
        return Ok(Some(None));
    }
    Ok(Some(Some(buf[0])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_small_payload() {
        let (r, w) = new_nonblocking_pipe().unwrap();
        let payload = b"hello world".to_vec();
        write_frame(w, &payload, Instant::now() + Duration::from_secs(1)).unwrap();
        let got = read_frame(r, Duration::from_millis(50)).unwrap();
        assert_eq!(got, payload);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn frame_round_trips_large_payload() {
        let (r, w) = new_nonblocking_pipe().unwrap();
        let payload = vec![0x42u8; PIPE_ATOMIC_SIZE * 3];
        let expected = payload.clone();
        let writer = std::thread::spawn(move || {
            write_frame(w, &payload, Instant::now() + Duration::from_secs(5)).unwrap();
            close_fd(w);
        });
        let got = read_frame(r, Duration::from_millis(50)).unwrap();
        writer.join().unwrap();
        assert_eq!(got, expected);
        close_fd(r);
    }

    #[test]
    fn read_frame_reports_channel_broken_on_early_close() {
        let (r, w) = new_nonblocking_pipe().unwrap();
        close_fd(w);
        let err = read_frame(r, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FrameError::ChannelBroken));
        close_fd(r);
    }

    #[test]
    fn read_frame_reports_channel_broken_on_short_first_read() {
        // Only 2 bytes ever land on the fd — fewer than the 4-byte header,
        // and the write end is left open, so this can only be distinguished
        // from "header split across two reads" by treating a short first
        // read itself as broken, per spec.
        let (r, w) = new_nonblocking_pipe().unwrap();
        try_write(w, &[0x01, 0x02]).unwrap();
        let err = read_frame(r, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FrameError::ChannelBroken));
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn result_byte_round_trips() {
        let (r, w) = new_nonblocking_pipe().unwrap();
        write_result_byte(w, RESULT_SUCCESS).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let got = read_result_byte(r).unwrap();
        assert_eq!(got, Some(Some(RESULT_SUCCESS)));
        close_fd(r);
        close_fd(w);
    }
}
