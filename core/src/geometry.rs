//! Planar transforms between frame and reference coordinates
//!
//! A handheld burst of a mostly planar scene is modeled per frame as a 3x3
//! homography into the reference frame's pixel space. Transforms are seeded
//! from integrated gyro rotation and refined by optical flow.

use crate::frame::RotationSample;
use nalgebra::Matrix3;

/// Homography mapping frame pixel coordinates into reference coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarTransform {
    m: Matrix3<f32>,
}

impl PlanarTransform {
    pub fn identity() -> Self {
        Self {
            m: Matrix3::identity(),
        }
    }

    pub fn from_matrix(m: Matrix3<f32>) -> Self {
        Self { m }
    }

    pub fn from_translation(dx: f32, dy: f32) -> Self {
        Self {
            m: Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
        }
    }

    /// Seed a transform from a relative rotation sample under the planar
    /// scene approximation: `H = K * R * K^-1` with a small-angle rotation.
    ///
    /// `focal_px` is the focal length in pixels, `(cx, cy)` the principal
    /// point. For bursts without calibration, `focal_px ~ width` is a usable
    /// default.
    pub fn from_rotation(rotation: &RotationSample, focal_px: f32, cx: f32, cy: f32) -> Self {
        let (rx, ry, rz) = (rotation.rx, rotation.ry, rotation.rz);

        // First-order rotation matrix, valid for the few-degree shake of a
        // handheld burst.
        let r = Matrix3::new(1.0, -rz, ry, rz, 1.0, -rx, -ry, rx, 1.0);

        let k = Matrix3::new(focal_px, 0.0, cx, 0.0, focal_px, cy, 0.0, 0.0, 1.0);
        let k_inv = Matrix3::new(
            1.0 / focal_px,
            0.0,
            -cx / focal_px,
            0.0,
            1.0 / focal_px,
            -cy / focal_px,
            0.0,
            0.0,
            1.0,
        );

        Self { m: k * r * k_inv }
    }

    pub fn matrix(&self) -> &Matrix3<f32> {
        &self.m
    }

    /// Map a point through the homography.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.m;
        let w = m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)];
        let w = if w.abs() > 1e-10 { w } else { 1.0 };
        (
            (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)]) / w,
            (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)]) / w,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        self.m.try_inverse().map(|m| Self { m })
    }

    /// `self` followed by `other`.
    pub fn then(&self, other: &PlanarTransform) -> Self {
        Self {
            m: other.m * self.m,
        }
    }

    /// Accumulate a residual translation correction on top of the transform.
    pub fn corrected_by(&self, dx: f32, dy: f32) -> Self {
        self.then(&Self::from_translation(dx, dy))
    }

    pub fn translation(&self) -> (f32, f32) {
        (self.m[(0, 2)], self.m[(1, 2)])
    }

    /// Mean displacement of the four image corners under this transform.
    ///
    /// Used to normalize flow residuals: a residual measured against a large
    /// predicted motion is worth more than the same residual against none.
    pub fn predicted_magnitude(&self, width: u32, height: u32) -> f32 {
        let w = width.saturating_sub(1) as f32;
        let h = height.saturating_sub(1) as f32;
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];

        let mut total = 0.0;
        for &(x, y) in &corners {
            let (tx, ty) = self.apply(x, y);
            let (dx, dy) = (tx - x, ty - y);
            total += (dx * dx + dy * dy).sqrt();
        }
        total / corners.len() as f32
    }

    pub fn is_identity(&self, eps: f32) -> bool {
        (self.m - Matrix3::identity()).abs().max() < eps
    }
}

impl Default for PlanarTransform {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_maps_points_onto_themselves() {
        let t = PlanarTransform::identity();
        let (x, y) = t.apply(12.5, 3.25);
        assert!((x - 12.5).abs() < 1e-6);
        assert!((y - 3.25).abs() < 1e-6);
        assert!(t.is_identity(1e-6));
    }

    #[test]
    fn translation_shifts_and_inverts() {
        let t = PlanarTransform::from_translation(3.0, -2.0);
        assert_eq!(t.apply(1.0, 1.0), (4.0, -1.0));

        let inv = t.inverse().unwrap();
        let (x, y) = inv.apply(4.0, -1.0);
        assert!((x - 1.0).abs() < 1e-5);
        assert!((y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn composition_applies_in_order() {
        let a = PlanarTransform::from_translation(1.0, 0.0);
        let b = PlanarTransform::from_translation(0.0, 2.0);
        let (x, y) = a.then(&b).apply(0.0, 0.0);
        assert_eq!((x, y), (1.0, 2.0));
    }

    #[test]
    fn rotation_seed_produces_shift_around_principal_point() {
        // Pure yaw shifts the image roughly horizontally by f * ry.
        let rot = RotationSample::new(0.0, 0.01, 0.0);
        let t = PlanarTransform::from_rotation(&rot, 800.0, 400.0, 300.0);
        let (x, _) = t.apply(400.0, 300.0);
        assert!((x - 400.0 - 8.0).abs() < 0.5, "shift was {}", x - 400.0);
    }

    #[test]
    fn predicted_magnitude_scales_with_translation() {
        let small = PlanarTransform::from_translation(1.0, 0.0);
        let large = PlanarTransform::from_translation(6.0, 0.0);
        let (w, h) = (640, 480);
        assert!(large.predicted_magnitude(w, h) > small.predicted_magnitude(w, h));
        assert!((small.predicted_magnitude(w, h) - 1.0).abs() < 1e-4);
    }
}
