//! Integration tests for failures inside workers and callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use forkpool_core::{
    BackgroundTasks, EngineConfig, ErrorSummary, JobResult, Outcome, Reply, TaskHandle, sys,
};

const DEADLINE: Duration = Duration::from_secs(30);

fn finished<T: Clone>(handle: &TaskHandle<T>) -> Outcome<T> {
    let outcome = handle.wait_timeout(DEADLINE);
    assert!(!outcome.is_pending(), "{:?} did not finish in time", handle.id());
    outcome
}

fn raised<T: Clone + std::fmt::Debug>(handle: &TaskHandle<T>) -> ErrorSummary {
    match finished(handle) {
        Outcome::Raised(summary) => summary,
        other => panic!("expected a raised outcome, got {:?}", other),
    }
}

#[test]
fn test_panic_is_reported_with_message() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::with_defaults().unwrap();
    let handle = tasks.submit_task(|| 1 / std::hint::black_box(0u32));

    let summary = raised(&handle);
    assert!(summary.is_panic());
    assert!(summary.message.contains("divide by zero"));
    assert!(summary.rendered_trace.contains("panicked at"));
}

#[test]
fn test_explicit_error_summary() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::with_defaults().unwrap();
    let handle = tasks.submit(|| Err(ErrorSummary::new("QuotaExceeded", "over quota", "")));

    let summary = raised(&handle);
    assert_eq!(summary.kind_name, "QuotaExceeded");
    assert_eq!(summary.to_string(), "QuotaExceeded: over quota");
}

#[test]
fn test_worker_exit_reports_worker_died() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::with_defaults().unwrap();
    let dies = tasks.submit(|| -> JobResult<u32> { sys::exit_now(3) });

    let summary = raised(&dies);
    assert!(summary.is_worker_died());
    assert!(summary.message.contains("status 3"));

    // The engine keeps working after losing a worker.
    let next = tasks.submit_task(|| 9);
    assert_eq!(finished(&next), Outcome::Value(9));
}

#[test]
fn test_results_before_worker_death_are_kept() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::with_defaults().unwrap();

    // Occupy the only slot so the next two tasks are batched into one worker.
    let hold = tasks.submit_task(|| {
        thread::sleep(Duration::from_millis(200));
        0
    });
    let first = tasks.submit_task(|| 1);
    let second = tasks.submit(|| -> JobResult<u32> { sys::exit_now(0) });

    assert_eq!(finished(&hold), Outcome::Value(0));
    assert_eq!(finished(&first), Outcome::Value(1));
    assert!(raised(&second).is_worker_died());
}

#[test]
fn test_oversized_reply_is_payload_too_large() {
    let config = EngineConfig::new().with_max_payload_bytes(64);
    let tasks: BackgroundTasks<Vec<u8>> = BackgroundTasks::new(config).unwrap();

    let small = tasks.submit_task(|| vec![1u8; 8]);
    let large = tasks.submit_task(|| vec![2u8; 1024]);

    assert_eq!(finished(&small), Outcome::Value(vec![1u8; 8]));
    let summary = raised(&large);
    assert_eq!(summary.kind_name, "PayloadTooLarge");
    assert!(summary.message.contains("limit is 64"));
}

#[test]
fn test_no_result_reply() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::with_defaults().unwrap();
    let handle = tasks.submit(|| Ok(Reply::NoResult));
    assert_eq!(finished(&handle), Outcome::NoResult);
}

#[test]
fn test_panicking_callback_does_not_block_others() {
    let tasks: BackgroundTasks<u32> = BackgroundTasks::new(EngineConfig::new().with_max_processes(2))
        .unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let first = tasks.submit_task(|| {
        thread::sleep(Duration::from_millis(50));
        1
    });
    first.set_on_complete(|_| panic!("callback exploded"));

    let second = tasks.submit_task(|| {
        thread::sleep(Duration::from_millis(50));
        2
    });
    let counter = Arc::clone(&fired);
    second.set_on_complete(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(finished(&first), Outcome::Value(1));
    assert_eq!(finished(&second), Outcome::Value(2));

    let start = std::time::Instant::now();
    while fired.load(Ordering::SeqCst) == 0 && start.elapsed() < DEADLINE {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The engine is still usable afterwards.
    let third = tasks.submit_task(|| 3);
    assert_eq!(finished(&third), Outcome::Value(3));
}
