//! End-to-end tests for the forkpool CLI.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn forkpool() -> Command {
    Command::cargo_bin("forkpool").unwrap()
}

#[test]
fn test_run_reports_every_task() {
    forkpool()
        .args(["run", "--tasks", "4", "--max-processes", "2", "--sleep-ms", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task#1"))
        .stdout(predicate::str::contains("task#4"))
        .stdout(predicate::str::contains("4 ok, 0 raised"));
}

#[test]
fn test_run_fails_when_a_task_raises() {
    forkpool()
        .args(["run", "--tasks", "3", "--sleep-ms", "0", "--fail-every", "3"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("task 2 was asked to fail"))
        .stdout(predicate::str::contains("2 ok, 1 raised"))
        .stderr(predicate::str::contains("1 task(s) raised"));
}

#[test]
fn test_run_without_dispatcher() {
    forkpool()
        .args(["run", "--tasks", "2", "--sleep-ms", "0", "--no-background-thread"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no dispatcher)"))
        .stdout(predicate::str::contains("2 ok, 0 raised"));
}

#[test]
fn test_config_file_is_applied() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("engine.json");
    fs::write(&path, r#"{ "max_processes": 3, "dispatcher_tick_ms": 250 }"#).unwrap();

    let output = forkpool()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["max_processes"], 3);
    assert_eq!(json["dispatcher_tick_ms"], 250);
    assert_eq!(json["background_thread"], true);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("engine.json");
    fs::write(&path, r#"{ "max_processes": 0 }"#).unwrap();

    forkpool()
        .args(["run", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_processes must be at least 1"));
}
