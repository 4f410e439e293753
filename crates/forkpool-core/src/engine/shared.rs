//! Shared engine state.

use std::collections::VecDeque;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use super::dispatcher::{WakeReason, Waker};
use crate::config::EngineConfig;
use crate::protocol::FrameDecoder;
use crate::sys::Pid;
use crate::task::{Job, Supervise, TaskHandle, TaskId, TaskOutput};

/// A submission waiting for a worker.
pub(crate) struct QueuedTask<T> {
    pub(crate) id: TaskId,
    pub(crate) job: Job<T>,
    pub(crate) handle: TaskHandle<T>,
}

/// A live worker and the read end of its result pipe.
pub(crate) struct ChildRecord {
    pub(crate) pid: Pid,
    pub(crate) read_end: OwnedFd,
    pub(crate) decoder: FrameDecoder,
    /// Tasks of this worker's batch without a frame yet, in batch order.
    pub(crate) unreported: VecDeque<TaskId>,
}

/// Everything guarded by the engine mutex.
pub(crate) struct EngineState<T> {
    pub(crate) queue: VecDeque<QueuedTask<T>>,
    /// Handles of tasks handed to a worker, awaiting their frame.
    pub(crate) handles: FxHashMap<TaskId, TaskHandle<T>>,
    /// Live workers keyed by their pipe's read fd.
    pub(crate) children: FxHashMap<RawFd, ChildRecord>,
}

/// State shared by the facade, the dispatcher thread and every handle.
///
/// `state` is the single engine mutex; it is never held across a fork, pipe
/// I/O, `waitpid` or user code. `pass_guard` serializes supervisor passes so
/// frames from one worker are delivered in the order they were written.
pub(crate) struct Core<T> {
    pub(super) config: EngineConfig,
    pub(super) state: Mutex<EngineState<T>>,
    pub(super) pass_guard: Mutex<()>,
    waker: Mutex<Option<Waker>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl<T> Core<T> {
    pub(super) fn new(config: EngineConfig, waker: Option<Waker>) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                handles: FxHashMap::default(),
                children: FxHashMap::default(),
            }),
            pass_guard: Mutex::new(()),
            waker: Mutex::new(waker),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, EngineState<T>> {
        // No user code runs under this lock; a poisoned guard still holds
        // consistent tables.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until no supervisor pass is running, and keep others out.
    pub(super) fn wait_for_pass(&self) -> MutexGuard<'_, ()> {
        self.pass_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn next_task_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flag the engine closed. Returns `false` if it already was.
    pub(super) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn lock_waker(&self) -> MutexGuard<'_, Option<Waker>> {
        self.waker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wake the dispatcher thread, if there is one. A no-op once the wake
    /// pipe is released.
    pub(super) fn nudge(&self, reason: WakeReason) {
        if let Some(waker) = self.lock_waker().as_ref() {
            waker.nudge(reason);
        }
    }

    /// Both ends of the wake pipe, for closing in forked workers.
    pub(super) fn waker_fds(&self) -> Vec<RawFd> {
        self.lock_waker()
            .as_ref()
            .map(|waker| waker.fds().to_vec())
            .unwrap_or_default()
    }

    /// Close the write end of the wake pipe.
    ///
    /// Only called once the dispatcher thread, which owns the read end, has
    /// been joined.
    pub(super) fn release_waker(&self) {
        let waker = self.lock_waker().take();
        drop(waker);
    }

    pub(super) fn child_fds(&self) -> Vec<RawFd> {
        self.lock_state().children.keys().copied().collect()
    }

    pub(super) fn enqueue(&self, task: QueuedTask<T>) {
        self.lock_state().queue.push_back(task);
    }

    /// Queued tasks plus tasks awaiting their result.
    pub(super) fn outstanding_len(&self) -> usize {
        let state = self.lock_state();
        state.queue.len() + state.handles.len()
    }

    pub(super) fn outstanding(&self) -> Vec<TaskHandle<T>> {
        let state = self.lock_state();
        let mut in_flight: Vec<TaskHandle<T>> = state.handles.values().cloned().collect();
        in_flight.sort_by_key(TaskHandle::id);

        state
            .queue
            .iter()
            .map(|task| task.handle.clone())
            .chain(in_flight)
            .collect()
    }

    pub(super) fn worker_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .lock_state()
            .children
            .values()
            .map(|child| child.pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub(super) fn live_workers(&self) -> usize {
        self.lock_state().children.len()
    }

    /// Forget every live worker, closing the read ends of their pipes.
    ///
    /// Returns their pids so they can still be reaped.
    pub(super) fn detach_children(&self) -> Vec<Pid> {
        let children: Vec<ChildRecord> = self
            .lock_state()
            .children
            .drain()
            .map(|(_, child)| child)
            .collect();
        // Read ends close here, outside the lock.
        children.into_iter().map(|child| child.pid).collect()
    }
}

impl<T: TaskOutput> Supervise for Core<T> {
    fn run_pass(&self) {
        self.run_supervisor_pass();
    }
}
