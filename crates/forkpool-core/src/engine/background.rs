//! The public engine facade.

use std::fmt::{Debug, Display};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::dispatcher::{Dispatcher, WakeReason, Waker};
use super::shared::{Core, QueuedTask};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::sys::{self, ExitStatus, Pid};
use crate::task::{ErrorSummary, JobResult, Reply, Supervise, TaskHandle, TaskOutput};

/// Runs closures in forked worker processes and streams their results back.
///
/// Each submission returns a [`TaskHandle`] immediately. Workers are forked
/// from the submitting process on demand, up to
/// [`max_processes`](EngineConfig::max_processes) at a time; each one runs a
/// batch of queued tasks in order and exits. Results are collected by a
/// dispatcher thread, or, with
/// [`background_thread`](EngineConfig::background_thread) disabled, whenever
/// the caller submits or polls a handle.
///
/// ```no_run
/// use forkpool_core::{BackgroundTasks, EngineConfig};
///
/// let tasks = BackgroundTasks::<u64>::new(EngineConfig::new().with_max_processes(2))?;
/// let handle = tasks.submit_task(|| (1..=20u64).product());
/// assert_eq!(handle.wait().value(), Some(&2_432_902_008_176_640_000));
/// tasks.close();
/// # Ok::<(), forkpool_core::Error>(())
/// ```
pub struct BackgroundTasks<T: TaskOutput> {
    core: Arc<Core<T>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    reaper: Mutex<Option<JoinHandle<Vec<(Pid, ExitStatus)>>>>,
}

impl<T: TaskOutput> BackgroundTasks<T> {
    /// Create an engine, starting the dispatcher thread if configured.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        if !config.background_thread {
            return Ok(Self {
                core: Arc::new(Core::new(config, None)),
                dispatcher: Mutex::new(None),
                reaper: Mutex::new(None),
            });
        }

        let (wake_read, wake_write) = sys::pipe()?;
        sys::set_nonblocking(wake_read.as_raw_fd())?;
        sys::set_nonblocking(wake_write.as_raw_fd())?;
        let waker = Waker::new(wake_write, wake_read.as_raw_fd());

        let core = Arc::new(Core::new(config, Some(waker)));
        let dispatcher = Dispatcher::spawn(Arc::clone(&core), wake_read)?;
        debug!(
            max_processes = core.config.max_processes,
            "background task engine started"
        );

        Ok(Self {
            core,
            dispatcher: Mutex::new(Some(dispatcher)),
            reaper: Mutex::new(None),
        })
    }

    /// Create an engine with [`EngineConfig::default`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    /// Configuration this engine was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Queue a job and return its handle.
    ///
    /// The job runs in a forked worker. `Ok(Reply::Value(v))` delivers `v`,
    /// `Ok(Reply::NoResult)` completes the handle with `NoResult`, and
    /// `Err(summary)` or a panic completes it with `Raised`.
    ///
    /// Submitting to a closed engine logs a warning; the job never runs and
    /// the handle stays pending.
    pub fn submit<F>(&self, job: F) -> TaskHandle<T>
    where
        F: FnOnce() -> JobResult<T> + Send + 'static,
    {
        let id = self.core.next_task_id();
        let driver: Weak<dyn Supervise> = Arc::downgrade(&self.core) as Weak<dyn Supervise>;
        let handle = TaskHandle::new(id, Some(driver));

        if self.core.is_closed() {
            warn!(task = %id, "task submitted to a closed engine will never run");
        }
        self.core.enqueue(QueuedTask {
            id,
            job: Box::new(job),
            handle: handle.clone(),
        });

        if self.has_dispatcher() {
            self.core.nudge(WakeReason::NewTask);
        } else {
            self.core.run_supervisor_pass();
        }
        handle
    }

    /// Queue a closure whose return value is the task's result.
    pub fn submit_task<F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(move || Ok(Reply::Value(task())))
    }

    /// Queue a fallible closure; an `Err` is summarized into `Raised`.
    pub fn submit_fallible<F, E>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        E: Display + Debug + 'static,
    {
        self.submit(move || match task() {
            Ok(value) => Ok(Reply::Value(value)),
            Err(err) => Err(ErrorSummary::from_error(&err)),
        })
    }

    /// Queue a closure run only for its side effects.
    ///
    /// The handle completes with `NoResult`; if the engine stops listening
    /// first, the worker drops the reply silently.
    pub fn submit_detached<F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            task();
            Ok(Reply::NoResult)
        })
    }

    /// Drive one supervisor pass from the calling thread.
    ///
    /// Needed only without a dispatcher thread, and only when no handle is
    /// being polled.
    pub fn poll(&self) {
        self.core.run_supervisor_pass();
    }

    /// Stop the engine.
    ///
    /// Stops the dispatcher thread, waits for any running supervisor pass,
    /// then closes the wake pipe and every worker pipe without waiting for
    /// the workers, which are reaped by a background thread (see
    /// [`wait_reaped`](Self::wait_reaped)). Queued tasks are never started and
    /// their handles, like those of unreported running tasks, stay pending.
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        if !self.core.mark_closed() {
            return;
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            self.core.nudge(WakeReason::Shutdown);
            if dispatcher.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }

        let _pass = self.core.wait_for_pass();
        self.core.release_waker();
        let pids = self.core.detach_children();
        debug!(
            workers = pids.len(),
            outstanding = self.core.outstanding_len(),
            "background task engine closed"
        );
        if !pids.is_empty() {
            *self.reaper.lock().unwrap_or_else(PoisonError::into_inner) = spawn_reaper(pids);
        }
    }

    /// Wait for the workers still running at [`close`](Self::close) to exit
    /// and return how each of them ended.
    ///
    /// Returns an empty list before `close`, when no worker was running, or
    /// on a second call.
    pub fn wait_reaped(&self) -> Vec<(Pid, ExitStatus)> {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match reaper.map(JoinHandle::join) {
            Some(Ok(reaped)) => reaped,
            Some(Err(_)) => {
                warn!("reaper thread panicked");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of tasks queued or running without a result yet.
    pub fn len(&self) -> usize {
        self.core.outstanding_len()
    }

    /// Whether every submitted task has been delivered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of queued tasks in queue order, then of running tasks by id.
    pub fn outstanding(&self) -> Vec<TaskHandle<T>> {
        self.core.outstanding()
    }

    /// Number of live workers.
    pub fn live_workers(&self) -> usize {
        self.core.live_workers()
    }

    /// Pids of live workers, ascending.
    pub fn worker_pids(&self) -> Vec<Pid> {
        self.core.worker_pids()
    }

    /// Whether a dispatcher thread is running.
    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<T: TaskOutput> Drop for BackgroundTasks<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reap workers left running at close on a background thread.
///
/// Nobody has to join the thread; an unjoined handle just detaches it.
fn spawn_reaper(pids: Vec<Pid>) -> Option<JoinHandle<Vec<(Pid, ExitStatus)>>> {
    let count = pids.len();
    let spawned = thread::Builder::new()
        .name("forkpool-reaper".to_string())
        .spawn(move || {
            let mut reaped = Vec::with_capacity(pids.len());
            for pid in pids {
                match sys::wait_pid(pid) {
                    Ok(status) => {
                        debug!(pid, ?status, "reaped detached worker");
                        reaped.push((pid, status));
                    }
                    Err(err) => warn!(pid, error = %err, "failed to reap detached worker"),
                }
            }
            reaped
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(workers = count, error = %err, "failed to start reaper thread");
            None
        }
    }
}
