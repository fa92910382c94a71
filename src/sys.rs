//! Thin wrappers over the Unix primitives the core runs on.
//!
//! Everything here is a direct mapping to a syscall; error handling and
//! retry policy live with the callers. The wake mechanism is an
//! anonymous pipe: any thread writes one byte to interrupt a blocking
//! `poll(2)`, only the selector thread reads.

use std::io;
use std::os::fd::RawFd;

/// Readiness bits listeners always receive, subscribed or not.
pub(crate) const FORCED_EVENTS: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Reads from a file descriptor into the buffer.
///
/// Returns the byte count, or a negative value on error.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the byte count, or a negative value on error.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { libc::write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) -> i32 {
    unsafe { libc::close(fd) }
}

/// Creates the wake pipe. Both ends are close-on-exec.
pub(crate) fn sys_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];

    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            sys_close(fds[0]);
            sys_close(fds[1]);
            return Err(err);
        }
    }

    Ok((fds[0], fds[1]))
}

/// Blocks in `poll(2)` over `fds` with no timeout.
///
/// `EINTR` is not an error; the caller sees zero ready descriptors and
/// polls again.
pub(crate) fn sys_poll(fds: &mut [libc::pollfd]) -> io::Result<usize> {
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };

    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(n as usize)
}

/// Write end of a wake pipe.
///
/// The byte's value is ignored; its only purpose is to make a blocking
/// poll return so queued work and listener updates are honored.
pub(crate) struct Waker(pub(crate) RawFd);

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    /// Interrupts the poll by writing one byte to the pipe.
    pub(crate) fn wake(&self) {
        let buf = [1u8; 1];
        unsafe {
            libc::write(self.0, buf.as_ptr() as *const _, 1);
        }
    }
}

/// Drains one wake byte from the read end of the pipe.
pub(crate) fn sys_drain_wake(fd: RawFd) {
    let mut buf = [0u8; 1];
    unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut _, 1);
    }
}
