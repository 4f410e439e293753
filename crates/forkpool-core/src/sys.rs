//! Thin wrappers over the Unix calls the engine relies on.
//!
//! Everything here returns `io::Result` built from `errno`, retries `EINTR`
//! where a retry is meaningful, and never panics.

use std::ffi::c_int;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Process id of a worker.
pub type Pid = libc::pid_t;

/// Result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were read.
    Data(usize),
    /// Nothing available yet.
    WouldBlock,
    /// The writer closed its end.
    Eof,
}

/// Which side of a `fork` we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// Parent process, with the child's pid.
    Parent { child: Pid },
    /// The newly created child.
    Child,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exited normally with this code.
    Exited(i32),
    /// Terminated by this signal.
    Signaled(i32),
    /// Some other state reported by `waitpid`.
    Other(i32),
}

impl ExitStatus {
    /// Whether the child exited with code zero.
    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn set_fd_flag(fd: RawFd, get: c_int, set: c_int, flag: c_int) -> io::Result<()> {
    // SAFETY: fcntl with GET/SET flag commands has no memory-safety
    // requirements; an invalid fd is reported through errno.
    unsafe {
        let flags = cvt(libc::fcntl(fd, get))?;
        if flags & flag == 0 {
            cvt(libc::fcntl(fd, set, flags | flag))?;
        }
    }
    Ok(())
}

/// Create an anonymous pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2(2) writes.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2(2) succeeded, so both descriptors are open and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Create an anonymous pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec. Without `pipe2` the flag is set right after
/// creation, so a concurrent `exec` can still inherit the pair.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_fd_flag(fds[0], libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    set_fd_flag(fds[1], libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    Ok((read_end, write_end))
}

/// Put a descriptor in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    set_fd_flag(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)
}

/// Close a raw descriptor, treating an already-closed one as success.
pub fn close_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: closing an arbitrary integer is memory safe; EBADF is handled.
    if unsafe { libc::close(fd) } < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // On Linux the descriptor is released even when close is interrupted.
            Some(libc::EBADF) | Some(libc::EINTR) => return Ok(()),
            _ => return Err(err),
        }
    }
    Ok(())
}

/// Read into `buf` from a non-blocking descriptor.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<ReadStatus> {
    loop {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            return Ok(ReadStatus::Data(n as usize));
        }
        if n == 0 {
            return Ok(ReadStatus::Eof);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
            _ => return Err(err),
        }
    }
}

/// Write all of `bytes`, looping over partial writes.
///
/// A closed reader surfaces as `io::ErrorKind::BrokenPipe` (with `SIGPIPE`
/// ignored, see [`ignore_sigpipe`]).
pub fn write_all_fd(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe accepted no bytes"));
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// Wait until any of `fds` is readable (or hung up).
///
/// `None` waits forever, `Some(Duration::ZERO)` only checks. An interrupted
/// wait returns an empty list.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(c_int::MAX as u128) as c_int,
    };

    // SAFETY: `pollfds` is a valid array of `pollfds.len()` entries.
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    Ok(pollfds
        .iter()
        .filter(|p| p.revents & ready != 0)
        .map(|p| p.fd)
        .collect())
}

/// Fork the current process.
///
/// # Safety
///
/// In a multi-threaded parent only the calling thread exists in the child.
/// The child must not touch locks that other threads may have held at the
/// time of the fork, and should leave through [`exit_now`].
pub unsafe fn fork() -> io::Result<ForkResult> {
    // SAFETY: upheld by the caller.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(ForkResult::Child),
        child => Ok(ForkResult::Parent { child }),
    }
}

/// Block until `pid` exits and reap it.
pub fn wait_pid(pid: Pid) -> io::Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Other(status)
    })
}

/// Send `SIGKILL` to `pid`. A process that is already gone is not an error.
pub fn kill_pid(pid: Pid) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety requirements.
    if unsafe { libc::kill(pid, libc::SIGKILL) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Whether a process with this pid still exists (zombies included).
pub fn process_exists(pid: Pid) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Ignore `SIGPIPE` for the whole process so writes report `EPIPE` instead.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN is async-signal-safe and has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Point standard input at `/dev/null`.
pub fn redirect_stdin_to_null() -> io::Result<()> {
    // SAFETY: the path is a valid NUL-terminated string.
    let null = cvt(unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) })?;
    // SAFETY: both descriptors are valid; dup2 replaces fd 0 atomically.
    let dup = cvt(unsafe { libc::dup2(null, libc::STDIN_FILENO) });
    if null != libc::STDIN_FILENO {
        close_fd(null)?;
    }
    dup.map(|_| ())
}

/// Terminate the process immediately without running destructors or
/// `atexit` handlers inherited from the parent.
pub fn exit_now(code: i32) -> ! {
    // SAFETY: _exit never returns and has no preconditions.
    unsafe { libc::_exit(code) }
}
