//! Burst frame data model
//!
//! A burst is an ordered set of frames captured in rapid succession. Frames
//! are immutable once wrapped in a [`FrameSet`]; workers share them through
//! `Arc` without locking.

use crate::{CoreError, Result};
use image::{GrayImage, RgbImage};
use std::sync::Arc;

/// Identifier of a frame within one burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

/// Device rotation integrated over a frame's exposure window, in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RotationSample {
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
}

impl RotationSample {
    pub fn new(rx: f32, ry: f32, rz: f32) -> Self {
        Self { rx, ry, rz }
    }

    pub fn magnitude(&self) -> f32 {
        (self.rx * self.rx + self.ry * self.ry + self.rz * self.rz).sqrt()
    }

    /// Rotation of `self` relative to `other`.
    pub fn relative_to(&self, other: &RotationSample) -> RotationSample {
        RotationSample {
            rx: self.rx - other.rx,
            ry: self.ry - other.ry,
            rz: self.rz - other.rz,
        }
    }
}

/// Capture exposure metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureInfo {
    pub exposure_s: f32,
    pub iso: u32,
}

impl Default for ExposureInfo {
    fn default() -> Self {
        Self {
            exposure_s: 1.0 / 60.0,
            iso: 100,
        }
    }
}

/// One captured burst frame.
///
/// The pixel buffer is read-only once the frame enters a [`FrameSet`];
/// `quality_score` is written once by the quality gate beforehand. A
/// grayscale plane is derived at construction for alignment and scoring.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub id: FrameId,
    image: Arc<RgbImage>,
    gray: Arc<GrayImage>,
    pub timestamp_ms: u64,
    pub rotation: RotationSample,
    pub exposure: ExposureInfo,
    pub quality_score: f32,
}

impl CapturedFrame {
    pub fn new(
        id: FrameId,
        image: RgbImage,
        timestamp_ms: u64,
        rotation: RotationSample,
        exposure: ExposureInfo,
    ) -> Self {
        let gray = image::imageops::grayscale(&image);
        Self {
            id,
            image: Arc::new(image),
            gray: Arc::new(gray),
            timestamp_ms,
            rotation,
            exposure,
            quality_score: 0.0,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }
}

/// Gated, ordered frames plus the reference frame index.
///
/// Invariant: `reference_index` is in bounds and points at a frame that
/// passed gating. All frames share one resolution.
#[derive(Debug, Clone)]
pub struct FrameSet {
    frames: Vec<Arc<CapturedFrame>>,
    reference_index: usize,
}

impl FrameSet {
    pub fn new(frames: Vec<CapturedFrame>, reference_index: usize) -> Result<Self> {
        if frames.is_empty() {
            return Err(CoreError::EmptyBurst);
        }
        if reference_index >= frames.len() {
            return Err(CoreError::InvalidReference {
                index: reference_index,
                len: frames.len(),
            });
        }

        let (w, h) = (frames[0].width(), frames[0].height());
        for f in &frames {
            if f.width() != w || f.height() != h {
                return Err(CoreError::DimensionMismatch(format!(
                    "frame {:?} is {}x{}, burst is {}x{}",
                    f.id,
                    f.width(),
                    f.height(),
                    w,
                    h
                )));
            }
        }

        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            reference_index,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.frames[0].width()
    }

    pub fn height(&self) -> u32 {
        self.frames[0].height()
    }

    pub fn frames(&self) -> &[Arc<CapturedFrame>] {
        &self.frames
    }

    pub fn get(&self, index: usize) -> Option<&Arc<CapturedFrame>> {
        self.frames.get(index)
    }

    pub fn reference_index(&self) -> usize {
        self.reference_index
    }

    pub fn reference(&self) -> &Arc<CapturedFrame> {
        &self.frames[self.reference_index]
    }

    /// Promote a different frame to reference after the current one is
    /// invalidated. Downstream transforms must be recomputed by the caller.
    pub fn promote_reference(&mut self, index: usize) -> Result<()> {
        if index >= self.frames.len() {
            return Err(CoreError::InvalidReference {
                index,
                len: self.frames.len(),
            });
        }
        log::debug!(
            "promoting frame {:?} to reference (was {:?})",
            self.frames[index].id,
            self.reference().id
        );
        self.reference_index = index;
        Ok(())
    }

    /// Index of the sharpest frame other than `skip`.
    pub fn sharpest_except(&self, skip: usize) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .max_by(|(_, a), (_, b)| {
                a.quality_score
                    .partial_cmp(&b.quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(id: u32, w: u32, h: u32) -> CapturedFrame {
        CapturedFrame::new(
            FrameId(id),
            RgbImage::new(w, h),
            id as u64 * 33,
            RotationSample::default(),
            ExposureInfo::default(),
        )
    }

    #[test]
    fn frame_set_rejects_empty_burst() {
        assert!(matches!(
            FrameSet::new(vec![], 0),
            Err(CoreError::EmptyBurst)
        ));
    }

    #[test]
    fn frame_set_rejects_mixed_dimensions() {
        let result = FrameSet::new(vec![frame(0, 8, 8), frame(1, 8, 6)], 0);
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
    }

    #[test]
    fn frame_set_validates_reference_index() {
        let result = FrameSet::new(vec![frame(0, 8, 8)], 3);
        assert!(matches!(
            result,
            Err(CoreError::InvalidReference { index: 3, len: 1 })
        ));
    }

    #[test]
    fn promote_reference_switches_frames() {
        let mut set = FrameSet::new(vec![frame(0, 8, 8), frame(1, 8, 8)], 0).unwrap();
        set.promote_reference(1).unwrap();
        assert_eq!(set.reference().id, FrameId(1));
    }

    #[test]
    fn rotation_relative_and_magnitude() {
        let a = RotationSample::new(0.03, 0.0, 0.04);
        let b = RotationSample::new(0.03, 0.0, 0.0);
        let rel = a.relative_to(&b);
        assert!((rel.magnitude() - 0.04).abs() < 1e-6);
    }
}
