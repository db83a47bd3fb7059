//! Frame quality gating and burst alignment
//!
//! Scores and selects usable burst frames, then computes a per-frame planar
//! transform into the reference frame's pixel space with sub-pixel accuracy.

pub mod engine;
pub mod flow;
pub mod quality;

pub use engine::*;
pub use flow::*;
pub use quality::*;

pub type Result<T> = std::result::Result<T, AlignError>;

/// Frames aligning below this confidence are excluded from fusion entirely;
/// down-weighting a badly aligned frame still ghosts.
pub const MIN_ALIGN_CONFIDENCE: f32 = 0.35;

#[derive(Debug, thiserror::Error)]
pub enum AlignError {
    #[error("Only {usable} usable frame(s) after gating and alignment")]
    InsufficientFrames { usable: usize },

    #[error("Reference frame has no trackable texture")]
    ReferenceUnusable,

    #[error(transparent)]
    Core(#[from] burst_core::CoreError),
}
