//! Alignment engine
//!
//! Seeds every non-reference frame's transform from its rotation sample (or
//! a caller-supplied cached map), refines it with pyramidal flow, and
//! derives a confidence that gates the frame in or out of fusion.

use crate::flow::{trackable_energy, FlowRefinement, PyramidFlow};
use crate::{AlignError, Result, MIN_ALIGN_CONFIDENCE};
use burst_core::{FrameId, FrameSet, PlanarTransform};
use rayon::prelude::*;
use std::collections::HashMap;

/// Floor for the predicted-motion normalizer, in pixels. Keeps a near-static
/// seed from inflating the confidence of an equally small residual.
const MIN_PREDICTED_MOTION: f32 = 1.5;

/// Reference frames with less mean gradient than this cannot anchor a burst.
const MIN_REFERENCE_ENERGY: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct AlignmentResult {
    /// Maps the frame's pixel coordinates into reference coordinates.
    pub transform: PlanarTransform,
    pub confidence: f32,
}

/// Per-frame alignment outcomes plus the frames excluded from fusion.
#[derive(Debug, Clone, Default)]
pub struct AlignmentMap {
    results: HashMap<FrameId, AlignmentResult>,
    excluded: Vec<FrameId>,
}

impl AlignmentMap {
    pub fn get(&self, id: FrameId) -> Option<&AlignmentResult> {
        self.results.get(&id)
    }

    pub fn is_included(&self, id: FrameId) -> bool {
        self.results.contains_key(&id)
    }

    pub fn included_count(&self) -> usize {
        self.results.len()
    }

    pub fn excluded(&self) -> &[FrameId] {
        &self.excluded
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.values().map(|r| r.confidence).sum::<f32>() / self.results.len() as f32
    }
}

#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    pub flow: PyramidFlow,
    pub min_confidence: f32,
    /// Focal length in pixels for the rotation seed; defaults to the frame
    /// width when the device supplies no calibration.
    pub focal_px: Option<f32>,
}

impl Default for AlignmentEngine {
    fn default() -> Self {
        Self {
            flow: PyramidFlow::default(),
            min_confidence: MIN_ALIGN_CONFIDENCE,
            focal_px: None,
        }
    }
}

impl AlignmentEngine {
    /// Align every frame of `set` into the reference frame's space.
    ///
    /// `cached` is an explicit optional seed source: when a previous run's
    /// map is supplied, its transforms replace the rotation seeds for the
    /// frames they cover. A degenerate reference promotes the next sharpest
    /// frame once before giving up.
    pub fn align(&self, set: &mut FrameSet, cached: Option<&AlignmentMap>) -> Result<AlignmentMap> {
        if trackable_energy(set.reference().gray()) < MIN_REFERENCE_ENERGY {
            let fallback = set
                .sharpest_except(set.reference_index())
                .ok_or(AlignError::ReferenceUnusable)?;
            log::warn!(
                "reference {:?} has no trackable texture, promoting a new one",
                set.reference().id
            );
            set.promote_reference(fallback)?;

            if trackable_energy(set.reference().gray()) < MIN_REFERENCE_ENERGY {
                return Err(AlignError::ReferenceUnusable);
            }
        }

        let reference = set.reference().clone();
        let reference_index = set.reference_index();
        let focal = self.focal_px.unwrap_or(reference.width() as f32);
        let cx = reference.width() as f32 / 2.0;
        let cy = reference.height() as f32 / 2.0;

        let refined: Vec<(FrameId, FlowRefinement, f32)> = set
            .frames()
            .par_iter()
            .enumerate()
            .filter(|(i, _)| *i != reference_index)
            .map(|(_, frame)| {
                let seed = match cached.and_then(|m| m.get(frame.id)) {
                    Some(prior) => prior.transform,
                    None => {
                        let relative = reference.rotation.relative_to(&frame.rotation);
                        PlanarTransform::from_rotation(&relative, focal, cx, cy)
                    }
                };

                let predicted = seed
                    .predicted_magnitude(frame.width(), frame.height())
                    .max(MIN_PREDICTED_MOTION);
                let refinement = self.flow.refine(reference.gray(), frame.gray(), &seed);
                (frame.id, refinement, predicted)
            })
            .collect();

        let mut map = AlignmentMap::default();
        map.results.insert(
            reference.id,
            AlignmentResult {
                transform: PlanarTransform::identity(),
                confidence: 1.0,
            },
        );

        for (id, refinement, predicted) in refined {
            let confidence = confidence_from_residual(refinement.residual_energy, predicted);

            if confidence < self.min_confidence || refinement.tracked_points == 0 {
                log::debug!(
                    "excluding frame {:?}: confidence {:.3} (residual {:.2}px over {:.2}px predicted)",
                    id,
                    confidence,
                    refinement.residual_energy,
                    predicted
                );
                map.excluded.push(id);
                continue;
            }

            map.results.insert(
                id,
                AlignmentResult {
                    transform: refinement.transform,
                    confidence,
                },
            );
        }
        map.excluded.sort();

        if map.included_count() < 2 {
            return Err(AlignError::InsufficientFrames {
                usable: map.included_count(),
            });
        }

        log::debug!(
            "aligned {}/{} frames, mean confidence {:.3}",
            map.included_count(),
            set.len(),
            map.mean_confidence()
        );
        Ok(map)
    }
}

/// Residual flow energy normalized against the seed's predicted motion.
///
/// The same residual scores higher against a large predicted motion than
/// against a near-static seed, where any leftover flow is suspicious.
fn confidence_from_residual(residual: f32, predicted: f32) -> f32 {
    if !residual.is_finite() {
        return 0.0;
    }
    let ratio = residual / predicted;
    (1.0 / (1.0 + 2.0 * ratio)).clamp(0.0, 1.0)
}
