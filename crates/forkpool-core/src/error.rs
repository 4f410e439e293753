//! Error types for forkpool-core.

use thiserror::Error;

use crate::protocol::FrameError;

/// Result type for forkpool-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine infrastructure.
///
/// Failures inside user tasks never show up here; they travel to the
/// submitter as [`Outcome::Raised`](crate::Outcome::Raised).
#[derive(Debug, Error)]
pub enum Error {
    /// Engine configuration was rejected.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A result frame could not be built or parsed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatcher thread could not be started or stopped.
    #[error("dispatcher error: {0}")]
    Dispatcher(String),
}
