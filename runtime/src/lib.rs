//! Job execution runtime
//!
//! Runs the burst fusion pipeline as a cancellable, checkpointable,
//! priority-aware unit of work on a bounded worker pool.

pub mod checkpoint;
pub mod device;
pub mod handle;
pub mod job;
pub mod progress;

pub use checkpoint::*;
pub use device::*;
pub use handle::*;
pub use job::*;
pub use progress::*;

pub type Result<T> = std::result::Result<T, JobError>;

/// Terminal failures a job can surface. Gating and alignment shortfalls
/// never appear here; they degrade to the single-frame fallback instead.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job cancelled")]
    Cancelled,

    #[error("Wall-clock budget exhausted after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Memory pressure exhausted: {0}")]
    MemoryPressure(String),

    #[error("Worker pool error: {0}")]
    Worker(String),
}
