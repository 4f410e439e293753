//! Body of a forked worker process.
//!
//! A worker runs its batch in order, writes one frame per task to its result
//! pipe and exits. It never returns into the caller's control flow.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use serde::Serialize;

use crate::protocol::{
    FrameError, WireFrame, WireOutcome, encode_frame, encode_frame_limited, encode_message,
};
use crate::sys;
use crate::task::{ErrorSummary, Job, TaskId, install_panic_capture, run_job};

/// Exit code of a worker that lost a reportable result to a broken pipe.
pub(crate) const EXIT_LOST_RESULT: i32 = 1;

/// Descriptors the child inherits from the engine and must drop.
pub(crate) struct Inherited {
    pub(crate) fds: Vec<RawFd>,
}

/// Entry point of the child side of a fork.
///
/// `SIGPIPE` is ignored for the child and every frame write checks for
/// `EPIPE` instead. Exits with status 0, or [`EXIT_LOST_RESULT`] when a
/// result that had to be reported could not be written.
pub(crate) fn run_worker<T: Serialize>(
    write_end: OwnedFd,
    batch: Vec<(TaskId, Job<T>)>,
    inherited: Inherited,
    max_payload: u64,
) -> ! {
    sys::ignore_sigpipe();
    install_panic_capture();

    let own = write_end.as_raw_fd();
    for fd in inherited.fds.into_iter().filter(|&fd| fd != own) {
        let _ = sys::close_fd(fd);
    }
    let _ = sys::redirect_stdin_to_null();

    let code = match process_batch(own, batch, max_payload) {
        Ok(()) => 0,
        Err(_) => EXIT_LOST_RESULT,
    };
    sys::exit_now(code)
}

/// Run every job and stream its outcome to `fd`.
///
/// Write failures never stop the batch. Returns the first failure to deliver
/// a result that was not [`WireOutcome::NoResult`].
pub(crate) fn process_batch<T: Serialize>(
    fd: RawFd,
    batch: Vec<(TaskId, Job<T>)>,
    max_payload: u64,
) -> io::Result<()> {
    let mut first_failure = None;

    for (id, job) in batch {
        let outcome = run_job(job);
        let skippable = outcome.is_skippable();
        let frame = encode_result(id, outcome, max_payload);

        if let Err(err) = sys::write_all_fd(fd, &frame) {
            if skippable && err.kind() == io::ErrorKind::BrokenPipe {
                continue;
            }
            if first_failure.is_none() {
                first_failure = Some(err);
            }
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Serialize and frame one result.
///
/// Replies the serializer rejects, or that exceed `max_payload`, are replaced
/// by a `Raised` summary so the submitter still hears about the task.
pub(crate) fn encode_result<T: Serialize>(
    id: TaskId,
    outcome: WireOutcome<T>,
    max_payload: u64,
) -> Vec<u8> {
    let fallback = match encode_message(&WireFrame { id, outcome }) {
        Ok(payload) => match encode_frame_limited(&payload, max_payload) {
            Ok(frame) => return frame,
            Err(FrameError::PayloadTooLarge { len, limit }) => {
                ErrorSummary::payload_too_large(len, limit)
            }
            Err(other) => ErrorSummary::serialization(other.to_string()),
        },
        Err(err) => ErrorSummary::serialization(err.to_string()),
    };

    // Summaries are small and always fit the full header range; if even this
    // fails nothing is written and the task is reported as `WorkerDied`.
    encode_message::<T>(&WireFrame {
        id,
        outcome: WireOutcome::Raised(fallback),
    })
    .and_then(|payload| Ok(encode_frame(&payload)?))
    .unwrap_or_default()
}
