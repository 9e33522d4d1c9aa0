//! GPU bridge error types.

use thiserror::Error;

/// Errors surfaced while constructing GPU timestamp contexts.
///
/// Zone begin/end and collection never fail; an allocator built against a
/// context that could not initialize simply records nothing.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Query heap creation failed at every attempted size.
    #[error("query heap creation failed: {0}")]
    HeapCreation(String),

    /// Readback buffer creation failed.
    #[error("readback buffer creation failed: {0}")]
    ReadbackCreation(String),

    /// The per-queue allocator budget is exhausted.
    #[error("too many command allocator contexts for one queue (max {0})")]
    TooManyAllocators(u32),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
