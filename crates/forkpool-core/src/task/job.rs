//! Jobs, replies and failure capture.
//!
//! A job is a boxed closure that already captured its arguments. Because the
//! worker is a fork of the submitting process, the closure and everything it
//! references are available in the child without serialization; only the
//! reply crosses the pipe.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::fmt::{Debug, Display};
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::WireOutcome;

/// What a job hands back when it finishes normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    /// A value to deliver to the submitter.
    Value(T),
    /// Nothing to deliver; losing this reply is acceptable.
    NoResult,
}

/// Result of running a job in a worker.
pub type JobResult<T> = std::result::Result<Reply<T>, ErrorSummary>;

/// A task body ready to run in a worker.
pub(crate) type Job<T> = Box<dyn FnOnce() -> JobResult<T> + Send>;

/// Eagerly rendered description of a failed task.
///
/// Built inside the worker at the point of failure; no stack objects
/// leave the child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind_name}: {message}")]
pub struct ErrorSummary {
    /// Error type name, or `"panic"` for panics.
    pub kind_name: String,
    /// Display rendering of the error or panic payload.
    pub message: String,
    /// Location, debug rendering and backtrace (when captured).
    pub rendered_trace: String,
}

pub(crate) const PANIC_KIND: &str = "panic";
pub(crate) const WORKER_DIED_KIND: &str = "WorkerDied";
pub(crate) const PAYLOAD_TOO_LARGE_KIND: &str = "PayloadTooLarge";
pub(crate) const SERIALIZATION_KIND: &str = "SerializationError";

impl ErrorSummary {
    /// Create a summary from its parts.
    pub fn new(
        kind_name: impl Into<String>,
        message: impl Into<String>,
        rendered_trace: impl Into<String>,
    ) -> Self {
        Self {
            kind_name: kind_name.into(),
            message: message.into(),
            rendered_trace: rendered_trace.into(),
        }
    }

    /// Summarize an error returned by a task.
    pub fn from_error<E: Display + Debug + 'static>(err: &E) -> Self {
        let backtrace = Backtrace::capture();
        let mut rendered_trace = format!("{:?}", err);
        if backtrace.status() == BacktraceStatus::Captured {
            rendered_trace.push('\n');
            rendered_trace.push_str(&backtrace.to_string());
        }
        Self::new(std::any::type_name::<E>(), err.to_string(), rendered_trace)
    }

    /// Summarize a panic payload caught by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        let rendered_trace = match LAST_PANIC.with(|slot| slot.borrow_mut().take()) {
            Some(record) => {
                let mut trace = format!("panicked at {}: {}", record.location, message);
                if let Some(backtrace) = record.backtrace {
                    trace.push('\n');
                    trace.push_str(&backtrace);
                }
                trace
            }
            None => format!("panicked: {}", message),
        };
        Self::new(PANIC_KIND, message, rendered_trace)
    }

    /// Summary for a task whose worker exited before reporting it.
    pub fn worker_died(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(WORKER_DIED_KIND, detail.clone(), detail)
    }

    /// Summary for a reply too large to frame.
    pub fn payload_too_large(len: u64, limit: u64) -> Self {
        let message = format!("serialized reply is {} bytes, limit is {}", len, limit);
        Self::new(PAYLOAD_TOO_LARGE_KIND, message.clone(), message)
    }

    /// Summary for a reply the serializer refused.
    pub(crate) fn serialization(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(SERIALIZATION_KIND, detail.clone(), detail)
    }

    /// Whether this summary describes a panic.
    pub fn is_panic(&self) -> bool {
        self.kind_name == PANIC_KIND
    }

    /// Whether this summary was synthesized because the worker died.
    pub fn is_worker_died(&self) -> bool {
        self.kind_name == WORKER_DIED_KIND
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

struct PanicRecord {
    location: String,
    backtrace: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

/// Replace the panic hook with one that records location and backtrace.
///
/// Only called inside a freshly forked worker, where the hook is private to
/// the child. The record is consumed by the next [`ErrorSummary::from_panic`].
pub(crate) fn install_panic_capture() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = Backtrace::capture();
        let backtrace = (backtrace.status() == BacktraceStatus::Captured)
            .then(|| backtrace.to_string());
        LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(PanicRecord { location, backtrace }));
    }));
}

/// Run a job, turning panics into `Raised` outcomes.
pub(crate) fn run_job<T>(job: Job<T>) -> WireOutcome<T> {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(Reply::Value(value))) => WireOutcome::Value(value),
        Ok(Ok(Reply::NoResult)) => WireOutcome::NoResult,
        Ok(Err(summary)) => WireOutcome::Raised(summary),
        Err(payload) => WireOutcome::Raised(ErrorSummary::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk {0} is full")]
    struct DiskFull(u8);

    #[test]
    fn test_from_error_uses_type_name() {
        let summary = ErrorSummary::from_error(&DiskFull(3));
        assert!(summary.kind_name.ends_with("DiskFull"));
        assert_eq!(summary.message, "disk 3 is full");
        assert!(summary.rendered_trace.starts_with("DiskFull(3)"));
        assert_eq!(summary.to_string(), format!("{}: disk 3 is full", summary.kind_name));
    }

    #[test]
    fn test_run_job_value_and_no_result() {
        let job: Job<u32> = Box::new(|| Ok(Reply::Value(7)));
        assert_eq!(run_job(job), WireOutcome::Value(7));

        let job: Job<u32> = Box::new(|| Ok(Reply::NoResult));
        assert_eq!(run_job(job), WireOutcome::NoResult);
    }

    #[test]
    fn test_run_job_catches_panic() {
        let job: Job<u32> = Box::new(|| -> JobResult<u32> { panic!("boom {}", 42) });
        match run_job(job) {
            WireOutcome::Raised(summary) => {
                assert!(summary.is_panic());
                assert_eq!(summary.message, "boom 42");
                assert!(summary.rendered_trace.contains("boom 42"));
            }
            other => panic!("expected a raised outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_run_job_passes_error_summary_through() {
        let job: Job<u32> =
            Box::new(|| -> JobResult<u32> { Err(ErrorSummary::from_error(&DiskFull(1))) });
        match run_job(job) {
            WireOutcome::Raised(summary) => assert_eq!(summary.message, "disk 1 is full"),
            other => panic!("expected a raised outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_synthesized_summaries() {
        assert!(ErrorSummary::worker_died("pid 12 exited").is_worker_died());
        let too_large = ErrorSummary::payload_too_large(100, 10);
        assert_eq!(too_large.kind_name, "PayloadTooLarge");
        assert!(too_large.message.contains("100"));
    }
}
