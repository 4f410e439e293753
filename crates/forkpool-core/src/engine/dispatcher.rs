//! Background thread that sleeps on worker pipes and runs supervisor passes.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::shared::Core;
use crate::error::{Error, Result};
use crate::sys::{self, ReadStatus};
use crate::task::TaskOutput;

/// Byte written to the wake pipe. Only `Shutdown` changes behaviour; the
/// others just force the dispatcher to look again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WakeReason {
    Started = b's',
    NewTask = b't',
    NewChild = b'c',
    ChildExited = b'x',
    Shutdown = b'q',
}

/// Write side of the wake pipe.
pub(crate) struct Waker {
    write_end: OwnedFd,
    read_fd: RawFd,
}

impl Waker {
    /// Both ends must already be non-blocking.
    pub(crate) fn new(write_end: OwnedFd, read_fd: RawFd) -> Self {
        Self { write_end, read_fd }
    }

    pub(crate) fn nudge(&self, reason: WakeReason) {
        match sys::write_all_fd(self.write_end.as_raw_fd(), &[reason as u8]) {
            Ok(()) => {}
            // A full pipe already guarantees a wake-up.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => debug!(?reason, error = %err, "failed to wake dispatcher"),
        }
    }

    /// Descriptors of both ends, for closing in forked workers.
    pub(crate) fn fds(&self) -> [RawFd; 2] {
        [self.read_fd, self.write_end.as_raw_fd()]
    }
}

/// Running dispatcher thread.
pub(crate) struct Dispatcher {
    thread: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the thread and wait until it has entered its loop.
    pub(crate) fn spawn<T: TaskOutput>(core: Arc<Core<T>>, wake_read: OwnedFd) -> Result<Self> {
        let (started_tx, started_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("forkpool-dispatcher".to_string())
            .spawn(move || DispatchLoop { core, wake_read }.run(started_tx))
            .map_err(|e| Error::Dispatcher(format!("Failed to spawn dispatcher thread: {}", e)))?;

        started_rx
            .recv()
            .map_err(|_| Error::Dispatcher("Dispatcher thread exited during startup".to_string()))?;

        Ok(Self { thread })
    }

    /// Wait for the thread to finish. The caller sends the shutdown byte.
    pub(crate) fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

struct DispatchLoop<T> {
    core: Arc<Core<T>>,
    wake_read: OwnedFd,
}

impl<T: TaskOutput> DispatchLoop<T> {
    fn run(self, started: Sender<()>) {
        let wake_fd = self.wake_read.as_raw_fd();
        let tick = self.core.config.dispatcher_tick;

        self.core.nudge(WakeReason::Started);
        let _ = started.send(());
        debug!("dispatcher started");

        while !self.core.is_closed() {
            let mut fds = self.core.child_fds();
            fds.push(wake_fd);

            match sys::poll_readable(&fds, Some(tick)) {
                Ok(ready) => {
                    if ready.contains(&wake_fd) && self.drain_wake() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dispatcher poll failed");
                    thread::sleep(tick);
                }
            }

            self.core.run_supervisor_pass();
        }

        debug!("dispatcher stopped");
    }

    /// Consume pending wake bytes. Returns `true` when the loop must stop.
    fn drain_wake(&self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match sys::read_nonblocking(self.wake_read.as_raw_fd(), &mut buf) {
                Ok(ReadStatus::Data(n)) => {
                    if buf[..n].contains(&(WakeReason::Shutdown as u8)) {
                        return true;
                    }
                }
                Ok(ReadStatus::WouldBlock) => return false,
                // Nobody can wake us any more.
                Ok(ReadStatus::Eof) => return true,
                Err(err) => {
                    warn!(error = %err, "failed to read wake pipe");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_bytes_are_distinct() {
        let bytes = [
            WakeReason::Started,
            WakeReason::NewTask,
            WakeReason::NewChild,
            WakeReason::ChildExited,
            WakeReason::Shutdown,
        ]
        .map(|r| r as u8);
        for (i, a) in bytes.iter().enumerate() {
            assert!(bytes[i + 1..].iter().all(|b| b != a));
        }
    }

    #[test]
    fn test_nudge_never_blocks_on_full_pipe() {
        let (read_end, write_end) = sys::pipe().unwrap();
        sys::set_nonblocking(read_end.as_raw_fd()).unwrap();
        sys::set_nonblocking(write_end.as_raw_fd()).unwrap();
        let waker = Waker::new(write_end, read_end.as_raw_fd());

        // Far more than any pipe buffer holds.
        for _ in 0..200_000 {
            waker.nudge(WakeReason::NewTask);
        }

        let mut buf = [0u8; 8];
        assert!(matches!(
            sys::read_nonblocking(read_end.as_raw_fd(), &mut buf).unwrap(),
            ReadStatus::Data(_)
        ));
        assert_eq!(buf[0], b't');
    }
}
