//! Frame quality gate
//!
//! Scores every captured frame on blur, exposure consistency and rotation
//! magnitude, then keeps the best subset for fusion. The sharpest frame is
//! always retained as the reference candidate.

use crate::{AlignError, Result};
use burst_core::{CapturedFrame, FrameSet};
use burst_imgproc::{
    compute_histogram_normalized, histogram_l1_distance, laplacian_variance, median_histogram,
    pyr_down,
};
use rayon::prelude::*;

/// Relative weights of the quality sub-scores. Blur dominates: a sharp frame
/// with slightly off exposure fuses better than a well-exposed soft one.
#[derive(Debug, Clone, Copy)]
pub struct GateWeights {
    pub blur: f32,
    pub exposure: f32,
    pub rotation: f32,
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            blur: 0.6,
            exposure: 0.25,
            rotation: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameGate {
    /// How many frames to keep (sharpest-frame retention may not exceed it).
    pub target_count: usize,
    /// Absolute variance-of-Laplacian floor, measured on the half-resolution
    /// gray plane. Frames below it are dropped regardless of count and never
    /// backfilled.
    pub blur_floor: f32,
    pub weights: GateWeights,
}

impl Default for FrameGate {
    fn default() -> Self {
        Self {
            target_count: 6,
            blur_floor: 3.0,
            weights: GateWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameScores {
    blur_raw: f32,
    exposure_distance: f32,
    rotation: f32,
}

impl FrameGate {
    pub fn with_target_count(mut self, count: usize) -> Self {
        self.target_count = count.max(1);
        self
    }

    /// Score and select frames, producing a [`FrameSet`] whose reference is
    /// the sharpest retained frame. Pure function of its inputs.
    pub fn gate(&self, mut frames: Vec<CapturedFrame>) -> Result<FrameSet> {
        if frames.is_empty() {
            return Err(AlignError::InsufficientFrames { usable: 0 });
        }

        let scores: Vec<FrameScores> = {
            let histograms: Vec<[f32; 256]> = frames
                .par_iter()
                .map(|f| compute_histogram_normalized(f.gray()))
                .collect();
            let median = median_histogram(&histograms);

            frames
                .par_iter()
                .zip(histograms.par_iter())
                .map(|(frame, hist)| FrameScores {
                    // Half resolution stabilizes the metric against sensor
                    // noise and quarters the cost.
                    blur_raw: laplacian_variance(&pyr_down(frame.gray())),
                    exposure_distance: histogram_l1_distance(hist, &median),
                    rotation: frame.rotation.magnitude(),
                })
                .collect()
        };

        let max_blur = scores.iter().map(|s| s.blur_raw).fold(f32::MIN, f32::max);
        let max_rotation = scores.iter().map(|s| s.rotation).fold(0.0f32, f32::max);

        for (frame, s) in frames.iter_mut().zip(scores.iter()) {
            let blur_norm = if max_blur > 0.0 {
                s.blur_raw / max_blur
            } else {
                0.0
            };
            let exposure_score = (1.0 - s.exposure_distance / 2.0).clamp(0.0, 1.0);
            let rotation_score = if max_rotation > 0.0 {
                1.0 - s.rotation / max_rotation
            } else {
                1.0
            };

            frame.quality_score = self.weights.blur * blur_norm
                + self.weights.exposure * exposure_score
                + self.weights.rotation * rotation_score;
        }

        // Absolute blur floor: too soft to contribute detail, drop outright.
        let mut retained: Vec<(CapturedFrame, FrameScores)> = frames
            .into_iter()
            .zip(scores)
            .filter(|(frame, s)| {
                if s.blur_raw < self.blur_floor {
                    log::warn!(
                        "dropping frame {:?}: blur {:.2} below floor {:.2}",
                        frame.id,
                        s.blur_raw,
                        self.blur_floor
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        if retained.is_empty() {
            return Err(AlignError::InsufficientFrames { usable: 0 });
        }

        if retained.len() > self.target_count {
            let sharpest_id = retained
                .iter()
                .max_by(|a, b| {
                    a.1.blur_raw
                        .partial_cmp(&b.1.blur_raw)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(f, _)| f.id)
                .unwrap_or(retained[0].0.id);

            let mut order: Vec<usize> = (0..retained.len()).collect();
            order.sort_by(|&a, &b| {
                retained[b]
                    .0
                    .quality_score
                    .partial_cmp(&retained[a].0.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(retained[a].0.id.cmp(&retained[b].0.id))
            });

            let mut keep: Vec<usize> = order.into_iter().take(self.target_count).collect();
            if !keep.iter().any(|&i| retained[i].0.id == sharpest_id) {
                // The reference candidate survives the cut even when its
                // combined score does not.
                let sharpest_pos = retained
                    .iter()
                    .position(|(f, _)| f.id == sharpest_id)
                    .unwrap_or(0);
                let weakest = keep.len() - 1;
                keep[weakest] = sharpest_pos;
            }

            keep.sort_unstable();
            let mut selected = Vec::with_capacity(keep.len());
            let mut rest = retained;
            for (taken, idx) in keep.into_iter().enumerate() {
                selected.push(rest.remove(idx - taken));
            }
            retained = selected;
        }

        let reference_index = retained
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.1.blur_raw
                    .partial_cmp(&b.1.blur_raw)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        log::debug!(
            "gate kept {} frame(s), reference {:?}",
            retained.len(),
            retained[reference_index].0.id
        );

        let frames: Vec<CapturedFrame> = retained.into_iter().map(|(f, _)| f).collect();
        Ok(FrameSet::new(frames, reference_index)?)
    }
}
