//! Tile-streamed multi-frame fusion
//!
//! Partitions the output canvas into overlapping tiles sized to a device
//! memory budget, fuses warped burst samples per tile with a robust
//! estimator, optionally refines each tile, stitches the result, and scores
//! it against a bicubic single-frame baseline.

pub mod accumulate;
pub mod refine;
pub mod stitch;
pub mod tile;
pub mod validate;

pub use accumulate::*;
pub use refine::*;
pub use stitch::*;
pub use tile::*;
pub use validate::*;

use burst_core::RobustLoss;

pub type Result<T> = std::result::Result<T, FusionError>;

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Tile working set exceeds memory ceiling: {0}")]
    MemoryPressure(String),

    #[error("Invalid output geometry: {0}")]
    InvalidGeometry(String),
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Output upscale factor.
    pub scale_factor: u32,
    /// Tile edge in output pixels before budget shrinking.
    pub tile_size: u32,
    /// Overlap margin in output pixels on every tile side.
    pub overlap: u32,
    pub loss: RobustLoss,
    pub irls_iterations: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            scale_factor: 2,
            tile_size: 256,
            overlap: 32,
            loss: RobustLoss::default(),
            irls_iterations: 3,
        }
    }
}
