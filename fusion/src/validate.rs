//! Pipeline-level quality validation
//!
//! Scores a stitched result against the bicubic single-frame baseline and
//! aggregates per-tile statistics. A weak result is flagged, never rejected.

use crate::accumulate::TileStats;
use burst_imgproc::{mean_abs_laplacian, resize_rgb, Interpolation};
use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Fusion measurably beat the baseline.
    Fused,
    /// Result is returned but did not clearly improve on a plain upscale.
    LowConfidence,
}

/// Computed once per job; immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct QualityMetrics {
    pub mean_contribution: f32,
    pub mean_alignment_confidence: f32,
    /// Fused high-frequency energy over the bicubic baseline's.
    pub detail_gain: f32,
    pub rejected_frames: usize,
    pub status: ResultStatus,
}

impl QualityMetrics {
    /// Metrics for the degraded single-frame path: one contribution
    /// everywhere, no gain over the baseline by construction.
    pub fn single_frame(rejected_frames: usize) -> Self {
        Self {
            mean_contribution: 1.0,
            mean_alignment_confidence: 0.0,
            detail_gain: 1.0,
            rejected_frames,
            status: ResultStatus::LowConfidence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityValidator {
    /// Detail gain below this is not worth calling an improvement.
    pub min_detail_gain: f32,
    /// Mean contributions below this mean most pixels saw a single frame.
    pub min_mean_contribution: f32,
}

impl Default for QualityValidator {
    fn default() -> Self {
        Self {
            min_detail_gain: 1.02,
            min_mean_contribution: 2.0,
        }
    }
}

impl QualityValidator {
    pub fn validate(
        &self,
        stitched: &RgbImage,
        reference: &RgbImage,
        tile_stats: &[TileStats],
        mean_alignment_confidence: f32,
        rejected_frames: usize,
    ) -> QualityMetrics {
        let mean_contribution = if tile_stats.is_empty() {
            0.0
        } else {
            tile_stats.iter().map(|s| s.mean_contribution).sum::<f32>() / tile_stats.len() as f32
        };

        let detail_gain = self.detail_gain(stitched, reference);

        let status = if detail_gain < self.min_detail_gain
            || mean_contribution < self.min_mean_contribution
        {
            log::info!(
                "low-confidence result: detail gain {detail_gain:.3}, \
                 mean contribution {mean_contribution:.2}"
            );
            ResultStatus::LowConfidence
        } else {
            ResultStatus::Fused
        };

        QualityMetrics {
            mean_contribution,
            mean_alignment_confidence,
            detail_gain,
            rejected_frames,
            status,
        }
    }

    /// High-frequency energy of the fused output relative to a bicubic
    /// upscale of the reference frame alone.
    fn detail_gain(&self, stitched: &RgbImage, reference: &RgbImage) -> f32 {
        let baseline = resize_rgb(
            reference,
            stitched.width(),
            stitched.height(),
            Interpolation::Cubic,
        );

        let fused_energy = mean_abs_laplacian(&image::imageops::grayscale(stitched));
        let baseline_energy = mean_abs_laplacian(&image::imageops::grayscale(&baseline));

        if baseline_energy <= 1e-6 {
            1.0
        } else {
            fused_energy / baseline_energy
        }
    }
}
