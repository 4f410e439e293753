//! Future-like handle returned for every submission.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::{Outcome, TaskId};

/// Something that can make progress on behalf of a waiting handle.
///
/// Implemented by the engine core; a handle keeps a weak reference so it
/// never keeps the engine alive on its own.
pub(crate) trait Supervise: Send + Sync {
    /// Run one non-blocking supervisor pass.
    fn run_pass(&self);
}

type Callback<T> = Box<dyn FnOnce(&TaskHandle<T>) + Send>;

/// Poll interval used by [`TaskHandle::wait`].
const WAIT_INTERVAL: Duration = Duration::from_millis(2);

struct HandleState<T> {
    outcome: Outcome<T>,
    callback: Option<Callback<T>>,
    fired: bool,
}

struct HandleInner<T> {
    id: TaskId,
    state: Mutex<HandleState<T>>,
    driver: Option<Weak<dyn Supervise>>,
}

/// Caller-side view of one submitted task.
///
/// Cloning is cheap; all clones observe the same outcome. The outcome moves
/// from `Pending` to a final state exactly once, and a completion callback
/// registered with [`set_on_complete`](Self::set_on_complete) fires exactly
/// once whether it was registered before or after that transition.
pub struct TaskHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("pending", &self.lock().outcome.is_pending())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, driver: Option<Weak<dyn Supervise>>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                state: Mutex::new(HandleState {
                    outcome: Outcome::Pending,
                    callback: None,
                    fired: false,
                }),
                driver,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState<T>> {
        // Callbacks run outside the lock, so poisoning can only come from a
        // panic in our own bookkeeping; the state is still consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submission id of this task.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Whether the outcome is known.
    pub fn is_done(&self) -> bool {
        !self.lock().outcome.is_pending()
    }

    /// Drive the engine once if the outcome is still unknown.
    fn drive(&self) {
        if self.is_done() {
            return;
        }
        if let Some(engine) = self.inner.driver.as_ref().and_then(Weak::upgrade) {
            engine.run_pass();
        }
    }

    /// Inspect the current outcome without cloning it.
    ///
    /// Drives one supervisor pass first if the task is still pending.
    pub fn with_outcome<R>(&self, f: impl FnOnce(&Outcome<T>) -> R) -> R {
        self.drive();
        f(&self.lock().outcome)
    }

    /// Wait up to `timeout` for the outcome, polling the engine.
    ///
    /// Returns `Outcome::Pending` if the deadline passes first.
    pub fn wait_timeout(&self, timeout: Duration) -> Outcome<T>
    where
        T: Clone,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self.get_outcome();
            if !outcome.is_pending() || Instant::now() >= deadline {
                return outcome;
            }
            std::thread::sleep(WAIT_INTERVAL);
        }
    }

    /// Wait for the outcome, polling the engine until it is known.
    ///
    /// Never returns if the task was still queued or running when the engine
    /// was closed.
    pub fn wait(&self) -> Outcome<T>
    where
        T: Clone,
    {
        loop {
            let outcome = self.get_outcome();
            if !outcome.is_pending() {
                return outcome;
            }
            std::thread::sleep(WAIT_INTERVAL);
        }
    }

    /// Register a callback to run when the outcome is known.
    ///
    /// If the task already finished and no callback has fired for it yet, the
    /// callback runs synchronously before this returns. A callback registered
    /// after one has already fired is stored but never invoked.
    pub fn set_on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&TaskHandle<T>) + Send + 'static,
    {
        let fire_now = {
            let mut state = self.lock();
            if !state.outcome.is_pending() && !state.fired {
                state.fired = true;
                Some(callback)
            } else {
                state.callback = Some(Box::new(callback));
                None
            }
        };

        if let Some(callback) = fire_now {
            callback(self);
        }
    }

    /// Record the final outcome and fire any registered callback.
    ///
    /// # Panics
    ///
    /// Panics if the outcome was already set.
    pub(crate) fn complete(&self, outcome: Outcome<T>) {
        debug_assert!(!outcome.is_pending());
        let callback = {
            let mut state = self.lock();
            assert!(
                state.outcome.is_pending(),
                "{} completed more than once",
                self.inner.id
            );
            state.outcome = outcome;
            let callback = state.callback.take();
            if callback.is_some() {
                state.fired = true;
            }
            callback
        };

        if let Some(callback) = callback {
            callback(self);
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Current outcome, driving one supervisor pass if still pending.
    ///
    /// Never blocks beyond that single non-blocking pass.
    pub fn get_outcome(&self) -> Outcome<T> {
        self.with_outcome(Outcome::clone)
    }
}
