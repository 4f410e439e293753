//! Fork-based execution engine.
//!
//! - `background` - the public [`BackgroundTasks`] facade
//! - `shared` - state shared between the facade, handles and dispatcher
//! - `supervisor` - result collection, reaping and worker dispatch
//! - `dispatcher` - optional thread that runs supervisor passes on wake-ups
//! - `worker` - what a forked child does with its batch

mod background;
mod dispatcher;
mod shared;
mod supervisor;
mod worker;

pub use background::BackgroundTasks;
