//! Error types for the client.

use thiserror::Error;

/// Errors reported by the fallible surfaces of the client.
///
/// Instrumentation primitives never return errors: they succeed, are
/// silently dropped while no viewer is connected in on-demand mode, or
/// abort the process on unrecoverable allocation failure.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The profiler has already been started in this process.
    #[error("profiler already started")]
    AlreadyStarted,

    /// The profiler has not been started.
    #[error("profiler not started")]
    NotStarted,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
