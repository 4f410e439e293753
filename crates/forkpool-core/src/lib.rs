//! Fork-based background task engine.
//!
//! This crate provides:
//! - [`BackgroundTasks`], which runs closures in forked worker processes
//! - [`TaskHandle`], a future-like handle with completion callbacks
//! - A length-prefixed frame codec for streaming results over pipes
//! - Thin wrappers over the POSIX process and pipe primitives it needs
//!
//! Only Unix-like platforms with `fork(2)` are supported.

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod sys;
pub mod task;

pub use config::EngineConfig;
pub use engine::BackgroundTasks;
pub use error::{Error, Result};
pub use protocol::{FrameDecoder, FrameError};
pub use task::{ErrorSummary, JobResult, Outcome, Reply, TaskHandle, TaskId, TaskOutput};
