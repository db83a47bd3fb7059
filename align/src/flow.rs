//! Coarse-to-fine residual flow refinement
//!
//! Refines a seeded planar transform by tracking a gradient-selected point
//! grid between the reference and the warped frame across a Gaussian
//! pyramid, accumulating a residual correction per level. A final parabolic
//! fit on the SAD cost surface trims the estimate to sub-pixel accuracy.

use burst_core::PlanarTransform;
use burst_imgproc::{build_pyramid, get_pixel_bilinear, warp_perspective};
use image::GrayImage;
use nalgebra::{Matrix2, Matrix3, Vector2};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct PyramidFlow {
    /// Pyramid depth; coarse-to-fine over 3-4 levels covers handheld shake.
    pub levels: u32,
    /// Full tracking window edge, odd.
    pub window_size: usize,
    pub max_iterations: usize,
    pub epsilon: f32,
    /// Tracking grid spacing in pixels at each level.
    pub grid_step: u32,
    /// Minimum mean gradient magnitude inside the window for a point to be
    /// trackable.
    pub min_gradient: f32,
}

impl Default for PyramidFlow {
    fn default() -> Self {
        Self {
            levels: 3,
            window_size: 15,
            max_iterations: 8,
            epsilon: 0.02,
            grid_step: 12,
            min_gradient: 3.0,
        }
    }
}

/// Outcome of refining one frame against the reference.
#[derive(Debug, Clone, Copy)]
pub struct FlowRefinement {
    pub transform: PlanarTransform,
    /// Mean remaining flow magnitude at the finest level after correction.
    pub residual_energy: f32,
    pub tracked_points: usize,
}

impl PyramidFlow {
    pub fn with_levels(mut self, levels: u32) -> Self {
        self.levels = levels.max(1);
        self
    }

    /// Refine `seed` so that it maps `frame` coordinates onto `reference`.
    pub fn refine(
        &self,
        reference: &GrayImage,
        frame: &GrayImage,
        seed: &PlanarTransform,
    ) -> FlowRefinement {
        let ref_pyramid = build_pyramid(reference, self.levels);
        let frame_pyramid = build_pyramid(frame, self.levels);
        let levels = ref_pyramid.len().min(frame_pyramid.len());

        let mut transform = *seed;

        for level in (0..levels).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            let level_ref = &ref_pyramid[level];
            let level_transform = scale_transform(&transform, scale);
            let warped = warp_perspective(
                &frame_pyramid[level],
                &level_transform,
                level_ref.width(),
                level_ref.height(),
            );

            let flows = self.track_grid(level_ref, &warped);
            if flows.is_empty() {
                continue;
            }

            let (dx, dy) = component_median(&flows);
            // Tracked content sits at p + d in the warped frame; pull it back.
            transform = transform.corrected_by(-dx / scale, -dy / scale);
        }

        transform = self.subpixel_trim(reference, frame, transform);

        // Whatever flow remains after the final correction is the residual
        // the confidence model sees.
        let warped = warp_perspective(frame, &transform, reference.width(), reference.height());
        let flows = self.track_grid(reference, &warped);
        let residual_energy = if flows.is_empty() {
            f32::INFINITY
        } else {
            flows.iter().map(|(dx, dy)| (dx * dx + dy * dy).sqrt()).sum::<f32>()
                / flows.len() as f32
        };

        FlowRefinement {
            transform,
            residual_energy,
            tracked_points: flows.len(),
        }
    }

    /// Track every sufficiently textured grid point from `prev` to `next`.
    fn track_grid(&self, prev: &GrayImage, next: &GrayImage) -> Vec<(f32, f32)> {
        let half = (self.window_size / 2) as i32;
        let margin = half as u32 + 1;
        if prev.width() <= 2 * margin || prev.height() <= 2 * margin {
            return Vec::new();
        }

        let xs: Vec<u32> = (margin..prev.width() - margin)
            .step_by(self.grid_step as usize)
            .collect();
        let ys: Vec<u32> = (margin..prev.height() - margin)
            .step_by(self.grid_step as usize)
            .collect();

        ys.par_iter()
            .flat_map_iter(|&y| {
                xs.iter()
                    .filter_map(move |&x| self.track_point(prev, next, x as f32, y as f32))
            })
            .collect()
    }

    /// Iterative Lucas-Kanade at one point. Returns the flow `prev -> next`,
    /// or `None` for untrackable or diverged points.
    fn track_point(&self, prev: &GrayImage, next: &GrayImage, x: f32, y: f32) -> Option<(f32, f32)> {
        let half = (self.window_size / 2) as i32;

        let mut a: Matrix2<f64> = Matrix2::zeros();
        let mut gradient_energy = 0.0f32;
        let mut gradients = Vec::with_capacity((self.window_size * self.window_size) as usize);

        for dy in -half..=half {
            for dx in -half..=half {
                let px = x + dx as f32;
                let py = y + dy as f32;

                let ix = (get_pixel_bilinear(prev, px + 1.0, py)
                    - get_pixel_bilinear(prev, px - 1.0, py))
                    / 2.0;
                let iy = (get_pixel_bilinear(prev, px, py + 1.0)
                    - get_pixel_bilinear(prev, px, py - 1.0))
                    / 2.0;

                a[(0, 0)] += (ix * ix) as f64;
                a[(0, 1)] += (ix * iy) as f64;
                a[(1, 0)] += (ix * iy) as f64;
                a[(1, 1)] += (iy * iy) as f64;

                gradient_energy += (ix * ix + iy * iy).sqrt();
                gradients.push((ix, iy));
            }
        }

        let n = gradients.len() as f32;
        if gradient_energy / n < self.min_gradient {
            return None;
        }

        let a_inv = a.try_inverse()?;

        let mut u = 0.0f32;
        let mut v = 0.0f32;
        for _ in 0..self.max_iterations {
            let mut b: Vector2<f64> = Vector2::zeros();
            let mut idx = 0;
            for dy in -half..=half {
                for dx in -half..=half {
                    let px = x + dx as f32;
                    let py = y + dy as f32;
                    let (ix, iy) = gradients[idx];
                    idx += 1;

                    let it =
                        get_pixel_bilinear(next, px + u, py + v) - get_pixel_bilinear(prev, px, py);
                    b[0] += -(ix * it) as f64;
                    b[1] += -(iy * it) as f64;
                }
            }

            let delta = a_inv * b;
            u += delta[0] as f32;
            v += delta[1] as f32;

            if delta.norm() < self.epsilon as f64 {
                break;
            }
        }

        // Diverged tracks poison the component median less when removed.
        let limit = self.window_size as f32;
        if !u.is_finite() || !v.is_finite() || u.abs() > limit || v.abs() > limit {
            return None;
        }

        Some((u, v))
    }

    /// Parabolic fit on a 3x3 SAD cost surface around the current estimate;
    /// reverts when the refined offset does not actually lower the cost.
    fn subpixel_trim(
        &self,
        reference: &GrayImage,
        frame: &GrayImage,
        transform: PlanarTransform,
    ) -> PlanarTransform {
        let warped = warp_perspective(frame, &transform, reference.width(), reference.height());

        let mut costs = [[0.0f32; 3]; 3];
        for (j, row) in costs.iter_mut().enumerate() {
            for (i, cost) in row.iter_mut().enumerate() {
                *cost = grid_sad(reference, &warped, (i as f32 - 1.0, j as f32 - 1.0));
            }
        }

        let mut dx_sub = 0.0f32;
        let ax = costs[1][0] + costs[1][2] - 2.0 * costs[1][1];
        if ax.abs() > 1e-6 {
            dx_sub = ((costs[1][0] - costs[1][2]) / (2.0 * ax)).clamp(-0.5, 0.5);
        }

        let mut dy_sub = 0.0f32;
        let ay = costs[0][1] + costs[2][1] - 2.0 * costs[1][1];
        if ay.abs() > 1e-6 {
            dy_sub = ((costs[0][1] - costs[2][1]) / (2.0 * ay)).clamp(-0.5, 0.5);
        }

        if dx_sub == 0.0 && dy_sub == 0.0 {
            return transform;
        }

        let refined = grid_sad(reference, &warped, (dx_sub, dy_sub));
        if refined > costs[1][1] * 1.1 {
            return transform;
        }

        transform.corrected_by(-dx_sub, -dy_sub)
    }
}

/// Mean absolute difference between `reference` and `warped` shifted by
/// `offset`, sampled on a sparse pixel grid.
fn grid_sad(reference: &GrayImage, warped: &GrayImage, offset: (f32, f32)) -> f32 {
    let step = 4u32;
    let margin = 2u32;
    if reference.width() <= 2 * margin || reference.height() <= 2 * margin {
        return f32::MAX;
    }

    let mut sum = 0.0f32;
    let mut count = 0u32;
    for y in (margin..reference.height() - margin).step_by(step as usize) {
        for x in (margin..reference.width() - margin).step_by(step as usize) {
            let r = reference.get_pixel(x, y)[0] as f32;
            let w = get_pixel_bilinear(warped, x as f32 + offset.0, y as f32 + offset.1);
            sum += (r - w).abs();
            count += 1;
        }
    }

    if count > 0 {
        sum / count as f32
    } else {
        f32::MAX
    }
}

/// Component-wise median; robust against a minority of bad tracks.
fn component_median(flows: &[(f32, f32)]) -> (f32, f32) {
    let mut xs: Vec<f32> = flows.iter().map(|f| f.0).collect();
    let mut ys: Vec<f32> = flows.iter().map(|f| f.1).collect();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (xs[xs.len() / 2], ys[ys.len() / 2])
}

/// Conjugate a full-resolution transform into pyramid-level coordinates.
fn scale_transform(transform: &PlanarTransform, scale: f32) -> PlanarTransform {
    let s = Matrix3::new(scale, 0.0, 0.0, 0.0, scale, 0.0, 0.0, 0.0, 1.0);
    let s_inv = Matrix3::new(1.0 / scale, 0.0, 0.0, 0.0, 1.0 / scale, 0.0, 0.0, 0.0, 1.0);
    PlanarTransform::from_matrix(s * transform.matrix() * s_inv)
}

/// Mean gradient magnitude over a sparse grid; near zero means the image has
/// nothing to track against.
pub fn trackable_energy(image: &GrayImage) -> f32 {
    if image.width() < 4 || image.height() < 4 {
        return 0.0;
    }

    let mut sum = 0.0f32;
    let mut count = 0u32;
    for y in (1..image.height() - 1).step_by(3) {
        for x in (1..image.width() - 1).step_by(3) {
            let ix =
                (image.get_pixel(x + 1, y)[0] as f32 - image.get_pixel(x - 1, y)[0] as f32) / 2.0;
            let iy =
                (image.get_pixel(x, y + 1)[0] as f32 - image.get_pixel(x, y - 1)[0] as f32) / 2.0;
            sum += (ix * ix + iy * iy).sqrt();
            count += 1;
        }
    }

    if count > 0 {
        sum / count as f32
    } else {
        0.0
    }
}
