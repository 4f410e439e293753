//! Task identities, outcomes and the handles submitters hold.

mod handle;
mod job;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use handle::TaskHandle;
pub(crate) use handle::Supervise;
pub use job::{ErrorSummary, JobResult, Reply};
pub(crate) use job::{Job, install_panic_capture, run_job};

/// Identifier assigned to a submission, unique within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Values a task may hand back to its submitter.
///
/// Anything serde can move through bincode and that can cross threads.
pub trait TaskOutput: Serialize + DeserializeOwned + Send + 'static {}

impl<T> TaskOutput for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// State of a submission as seen by its handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Not known yet.
    Pending,
    /// The task returned a value.
    Value(T),
    /// The task finished without reporting anything.
    NoResult,
    /// The task failed, or its worker died before reporting it.
    Raised(ErrorSummary),
}

impl<T> Outcome<T> {
    /// Whether the outcome is still unknown.
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    /// The value, if the task returned one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The failure summary, if the task raised.
    pub fn raised(&self) -> Option<&ErrorSummary> {
        match self {
            Outcome::Raised(summary) => Some(summary),
            _ => None,
        }
    }

    /// Convert into a `Result`, mapping `Pending` and `NoResult` to `None`.
    pub fn into_result(self) -> Option<Result<T, ErrorSummary>> {
        match self {
            Outcome::Value(value) => Some(Ok(value)),
            Outcome::Raised(summary) => Some(Err(summary)),
            Outcome::Pending | Outcome::NoResult => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::new(12).to_string(), "task#12");
        assert_eq!(TaskId::new(12).as_u64(), 12);
    }

    #[test]
    fn test_outcome_accessors() {
        let value: Outcome<u8> = Outcome::Value(4);
        assert_eq!(value.value(), Some(&4));
        assert!(value.raised().is_none());
        assert_eq!(value.into_result(), Some(Ok(4)));

        let raised: Outcome<u8> = Outcome::Raised(ErrorSummary::new("E", "m", "t"));
        assert_eq!(raised.raised().map(|s| s.message.as_str()), Some("m"));

        assert!(Outcome::<u8>::Pending.is_pending());
        assert_eq!(Outcome::<u8>::NoResult.into_result(), None);
    }
}
