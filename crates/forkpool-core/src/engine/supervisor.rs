//! One non-blocking round of result collection, reaping and dispatch.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::TryLockError;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::dispatcher::WakeReason;
use super::shared::{ChildRecord, Core, QueuedTask};
use super::worker::{self, Inherited};
use crate::error::Error;
use crate::protocol::{FrameDecoder, WireFrame, decode_message};
use crate::sys::{self, ExitStatus, ForkResult, ReadStatus};
use crate::task::{ErrorSummary, Outcome, TaskHandle, TaskOutput};

/// Largest single read from a worker pipe.
const READ_CHUNK: usize = 64 * 1024;

/// A finished task whose handle is completed once the engine lock is free.
type Delivery<T> = (TaskHandle<T>, Outcome<T>);

/// How many queued tasks go to the next worker.
///
/// A single-worker engine hands the whole queue to one worker; otherwise
/// the queue is spread evenly over the worker slots.
pub(crate) fn batch_size(queued: usize, max_processes: usize) -> usize {
    if max_processes <= 1 {
        queued
    } else {
        queued.div_ceil(max_processes)
    }
}

/// Why a worker's pipe is being retired.
enum Retire {
    Eof,
    Corrupt(Error),
    ReadFailed(io::Error),
}

impl<T: TaskOutput> Core<T> {
    /// Collect finished results, reap exited workers and fork new ones.
    ///
    /// Returns at once if another pass is running or the engine is closed.
    pub(crate) fn run_supervisor_pass(&self) {
        let _pass = match self.pass_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if self.is_closed() {
            return;
        }

        let deliveries = self.drain_ready_pipes();
        deliver(deliveries);
        self.dispatch_pending();
    }

    fn drain_ready_pipes(&self) -> Vec<Delivery<T>> {
        let mut deliveries = Vec::new();
        let fds = self.child_fds();
        if fds.is_empty() {
            return deliveries;
        }

        let ready = match sys::poll_readable(&fds, Some(Duration::ZERO)) {
            Ok(ready) => ready,
            Err(err) => {
                warn!(error = %err, "failed to poll worker pipes");
                return deliveries;
            }
        };

        let mut buf = vec![0u8; READ_CHUNK];
        for fd in ready {
            self.drain_child(fd, &mut buf, &mut deliveries);
        }
        deliveries
    }

    /// Read everything currently available from one worker.
    fn drain_child(&self, fd: RawFd, buf: &mut [u8], deliveries: &mut Vec<Delivery<T>>) {
        loop {
            let wanted = match self.lock_state().children.get(&fd) {
                Some(child) => child.decoder.wanted().min(buf.len()),
                None => return,
            };

            let reason = match sys::read_nonblocking(fd, &mut buf[..wanted]) {
                Ok(ReadStatus::Data(n)) => match self.accept_bytes(fd, &buf[..n], deliveries) {
                    Ok(()) => continue,
                    Err(err) => Retire::Corrupt(err),
                },
                Ok(ReadStatus::WouldBlock) => return,
                Ok(ReadStatus::Eof) => Retire::Eof,
                Err(err) => Retire::ReadFailed(err),
            };
            self.retire_child(fd, reason, deliveries);
            return;
        }
    }

    /// Feed bytes to a worker's decoder and match complete frames to handles.
    fn accept_bytes(
        &self,
        fd: RawFd,
        bytes: &[u8],
        deliveries: &mut Vec<Delivery<T>>,
    ) -> Result<(), Error> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(child) = state.children.get_mut(&fd) else {
            return Ok(());
        };

        child.decoder.feed(bytes);
        for payload in child.decoder.drain()? {
            let frame: WireFrame<T> = decode_message(&payload)?;
            if let Some(pos) = child.unreported.iter().position(|id| *id == frame.id) {
                child.unreported.remove(pos);
            }
            match state.handles.remove(&frame.id) {
                Some(handle) => deliveries.push((handle, frame.outcome.into())),
                None => error!(task = %frame.id, pid = child.pid, "discarding result for unknown task"),
            }
        }
        Ok(())
    }

    /// Drop a worker's pipe, reap it and fail the tasks it never reported.
    fn retire_child(&self, fd: RawFd, reason: Retire, deliveries: &mut Vec<Delivery<T>>) {
        let (child, orphaned) = {
            let mut state = self.lock_state();
            let Some(child) = state.children.remove(&fd) else {
                return;
            };
            let orphaned: Vec<_> = child
                .unreported
                .iter()
                .filter_map(|id| state.handles.remove(id).map(|handle| (*id, handle)))
                .collect();
            (child, orphaned)
        };

        let ChildRecord {
            pid,
            read_end,
            decoder,
            ..
        } = child;
        drop(read_end);

        let cause = match reason {
            Retire::Eof => {
                if decoder.has_partial() {
                    warn!(pid, "worker pipe closed in the middle of a frame");
                }
                None
            }
            Retire::Corrupt(err) => {
                error!(pid, error = %err, "corrupt result stream, killing worker");
                Some(format!("corrupt result stream from worker {}: {}", pid, err))
            }
            Retire::ReadFailed(err) => {
                error!(pid, error = %err, "failed to read worker pipe, killing worker");
                Some(format!("failed to read result pipe of worker {}: {}", pid, err))
            }
        };
        if cause.is_some() {
            if let Err(err) = sys::kill_pid(pid) {
                warn!(pid, error = %err, "failed to kill worker");
            }
        }

        let status = sys::wait_pid(pid);
        match &status {
            Ok(status) => debug!(pid, ?status, "worker reaped"),
            Err(err) => warn!(pid, error = %err, "failed to reap worker"),
        }

        if !orphaned.is_empty() {
            let cause = cause.unwrap_or_else(|| describe_exit(pid, &status));
            warn!(pid, tasks = orphaned.len(), "{}", cause);
            for (id, handle) in orphaned {
                let summary = ErrorSummary::worker_died(format!("{} before reporting {}", cause, id));
                deliveries.push((handle, Outcome::Raised(summary)));
            }
        }

        self.nudge(WakeReason::ChildExited);
    }

    /// Fork one worker for the head of the queue if a slot is free.
    fn dispatch_pending(&self) {
        let max_processes = self.config.max_processes;
        let waker_fds = self.waker_fds();
        let (batch, inherited) = {
            let mut state = self.lock_state();
            if state.queue.is_empty() || state.children.len() >= max_processes {
                return;
            }
            let take = batch_size(state.queue.len(), max_processes);
            let batch: Vec<QueuedTask<T>> = state.queue.drain(..take).collect();

            let mut fds: Vec<RawFd> = state.children.keys().copied().collect();
            fds.extend(waker_fds);
            (batch, Inherited { fds })
        };

        if let Err((batch, err)) = self.spawn_worker(batch, inherited) {
            warn!(error = %err, tasks = batch.len(), "failed to start worker, requeueing batch");
            let mut state = self.lock_state();
            for task in batch.into_iter().rev() {
                state.queue.push_front(task);
            }
        }
    }

    fn spawn_worker(
        &self,
        batch: Vec<QueuedTask<T>>,
        inherited: Inherited,
    ) -> Result<(), (Vec<QueuedTask<T>>, io::Error)> {
        let (read_end, write_end) = match sys::pipe() {
            Ok(ends) => ends,
            Err(err) => return Err((batch, err)),
        };
        if let Err(err) = sys::set_nonblocking(read_end.as_raw_fd()) {
            return Err((batch, err));
        }

        // SAFETY: the child only runs the batch it was handed and leaves via
        // `_exit`; it never takes the engine locks.
        match unsafe { sys::fork() } {
            Err(err) => Err((batch, err)),
            Ok(ForkResult::Child) => {
                drop(read_end);
                let jobs = batch.into_iter().map(|task| (task.id, task.job)).collect();
                worker::run_worker(write_end, jobs, inherited, self.config.max_payload_bytes)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_end);
                let fd = read_end.as_raw_fd();
                let count = batch.len();

                let mut unreported = VecDeque::with_capacity(count);
                let mut jobs = Vec::with_capacity(count);
                {
                    let mut state = self.lock_state();
                    for task in batch {
                        unreported.push_back(task.id);
                        state.handles.insert(task.id, task.handle);
                        jobs.push(task.job);
                    }
                    state.children.insert(
                        fd,
                        ChildRecord {
                            pid: child,
                            read_end,
                            decoder: FrameDecoder::new(),
                            unreported,
                        },
                    );
                }
                // The parent's copies of the closures are dropped outside the lock.
                drop(jobs);

                debug!(pid = child, tasks = count, "forked worker");
                self.nudge(WakeReason::NewChild);
                Ok(())
            }
        }
    }
}

fn describe_exit(pid: sys::Pid, status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(ExitStatus::Exited(code)) => format!("worker {} exited with status {}", pid, code),
        Ok(ExitStatus::Signaled(signal)) => {
            format!("worker {} was killed by signal {}", pid, signal)
        }
        Ok(ExitStatus::Other(raw)) => format!("worker {} ended with wait status {}", pid, raw),
        Err(err) => format!("worker {} vanished ({})", pid, err),
    }
}

/// Complete handles. A panicking callback is logged and does not stop the
/// remaining deliveries.
fn deliver<T>(deliveries: Vec<Delivery<T>>) {
    for (handle, outcome) in deliveries {
        let id = handle.id();
        if panic::catch_unwind(AssertUnwindSafe(move || handle.complete(outcome))).is_err() {
            error!(task = %id, "completion callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_batch_size_single_worker_takes_everything() {
        assert_eq!(batch_size(1, 1), 1);
        assert_eq!(batch_size(17, 1), 17);
    }

    #[test]
    fn test_batch_size_spreads_over_slots() {
        assert_eq!(batch_size(1, 4), 1);
        assert_eq!(batch_size(4, 4), 1);
        assert_eq!(batch_size(5, 4), 2);
        assert_eq!(batch_size(10, 3), 4);
    }

    #[test]
    fn test_deliver_survives_panicking_callback() {
        let first: TaskHandle<u32> = TaskHandle::new(crate::task::TaskId::new(1), None);
        let second: TaskHandle<u32> = TaskHandle::new(crate::task::TaskId::new(2), None);

        first.set_on_complete(|_| panic!("callback failed"));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        second.set_on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        deliver(vec![
            (first.clone(), Outcome::Value(1)),
            (second.clone(), Outcome::Value(2)),
        ]);

        assert_eq!(first.get_outcome(), Outcome::Value(1));
        assert_eq!(second.get_outcome(), Outcome::Value(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_describe_exit() {
        assert!(describe_exit(12, &Ok(ExitStatus::Exited(3))).contains("status 3"));
        assert!(describe_exit(12, &Ok(ExitStatus::Signaled(9))).contains("signal 9"));
    }
}
