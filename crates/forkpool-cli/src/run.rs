//! Run command implementation for the forkpool CLI.
//!
//! Submits a batch of synthetic tasks, waits for every outcome and prints a
//! line per task followed by a summary.

use std::thread;
use std::time::{Duration, Instant};

use forkpool_core::{BackgroundTasks, EngineConfig, Outcome, TaskHandle};

use crate::colors;

/// Shape of the synthetic batch.
pub struct Workload {
    pub tasks: u64,
    pub sleep_ms: u64,
    pub fail_every: Option<u64>,
}

/// Failure injected into every Nth task.
#[derive(Debug, thiserror::Error)]
#[error("task {0} was asked to fail")]
pub struct InjectedFailure(pub u64);

/// What each task reports: its square and the worker that computed it.
type Answer = (u64, u32);

/// Run the workload and print its outcomes.
///
/// Fails if any task raised.
pub fn execute(config: EngineConfig, workload: &Workload) -> anyhow::Result<()> {
    let start = Instant::now();
    println!(
        "{}Running{} {} tasks on up to {} workers{}",
        colors::BOLD,
        colors::RESET,
        workload.tasks,
        config.max_processes,
        if config.background_thread {
            ""
        } else {
            " (no dispatcher)"
        }
    );

    let engine: BackgroundTasks<Answer> = BackgroundTasks::new(config)?;
    let handles: Vec<TaskHandle<Answer>> = (0..workload.tasks)
        .map(|index| submit_one(&engine, workload, index))
        .collect();

    let mut raised = 0usize;
    for handle in &handles {
        match handle.wait() {
            Outcome::Value((square, pid)) => println!(
                "  {} {}->{} {} {}(worker {}){}",
                handle.id(),
                colors::GREEN,
                colors::RESET,
                square,
                colors::DIM,
                pid,
                colors::RESET
            ),
            Outcome::Raised(summary) => {
                raised += 1;
                println!(
                    "  {} {}raised{} {}",
                    handle.id(),
                    colors::RED,
                    colors::RESET,
                    summary
                );
            }
            Outcome::NoResult => println!("  {} no result", handle.id()),
            Outcome::Pending => unreachable!("wait() only returns final outcomes"),
        }
    }
    engine.close();

    println!(
        "{}Completed{} {} tasks in {:.2}s: {} ok, {} raised",
        colors::BOLD,
        colors::RESET,
        handles.len(),
        start.elapsed().as_secs_f64(),
        handles.len() - raised,
        raised
    );

    if raised > 0 {
        anyhow::bail!("{} task(s) raised", raised);
    }
    Ok(())
}

fn submit_one(
    engine: &BackgroundTasks<Answer>,
    workload: &Workload,
    index: u64,
) -> TaskHandle<Answer> {
    let sleep = Duration::from_millis(workload.sleep_ms);
    let fails = should_fail(index, workload.fail_every);

    engine.submit_fallible(move || {
        thread::sleep(sleep);
        if fails {
            return Err(InjectedFailure(index));
        }
        Ok((index * index, std::process::id()))
    })
}

/// Every `n`th task, counting from 1, fails.
fn should_fail(index: u64, fail_every: Option<u64>) -> bool {
    match fail_every {
        Some(n) if n > 0 => (index + 1) % n == 0,
        _ => false,
    }
}
