pub mod frame;
pub mod geometry;
pub mod robust;

pub use frame::*;
pub use geometry::*;
pub use robust::*;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Burst contains no frames")]
    EmptyBurst,

    #[error("Frame dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Reference index {index} out of bounds for {len} frames")]
    InvalidReference { index: usize, len: usize },
}
