//! Robust fusion accumulator
//!
//! For every output pixel of a tile, gathers sub-pixel samples from each
//! included frame and combines them with an iteratively reweighted
//! M-estimator seeded from the weighted median. A minority of misaligned or
//! occluded samples cannot drag the estimate; they are down-weighted by the
//! bounded influence function.

use crate::tile::TileRegion;
use burst_align::AlignmentMap;
use burst_core::{weighted_median, FrameSet, PlanarTransform, RobustLoss};
use burst_imgproc::sample_bilinear_rgb;
use serde::{Deserialize, Serialize};

/// Residual spread floor in 8-bit intensity units; keeps the IRLS scale from
/// collapsing on noise-free synthetic input.
const MIN_SPREAD: f32 = 2.0;

/// Aggregate statistics of one fused tile.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TileStats {
    /// Mean frame contributions per output pixel.
    pub mean_contribution: f32,
    /// Fraction of pixels with at least one direct contribution.
    pub coverage: f32,
    /// Mean alignment confidence over contributing samples.
    pub mean_confidence: f32,
}

/// A fully fused tile, including its overlap margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedTile {
    pub region: TileRegion,
    /// Interleaved RGB, `ext_width * ext_height * 3`.
    pub pixels: Vec<f32>,
    /// Direct frame contributions per pixel.
    pub counts: Vec<u16>,
    pub stats: TileStats,
}

#[derive(Debug, Clone)]
pub struct FusionAccumulator {
    pub loss: RobustLoss,
    pub irls_iterations: usize,
    pub scale: u32,
}

impl FusionAccumulator {
    pub fn new(loss: RobustLoss, irls_iterations: usize, scale: u32) -> Self {
        Self {
            loss,
            irls_iterations,
            scale: scale.max(1),
        }
    }

    /// Fuse all included frames into one tile.
    pub fn accumulate(
        &self,
        region: &TileRegion,
        set: &FrameSet,
        alignment: &AlignmentMap,
    ) -> FinishedTile {
        // Transient per-tile view of the contributing frames; dropped with
        // this call, never retained across tiles.
        let contributors: Vec<(&burst_core::CapturedFrame, PlanarTransform, f32)> = set
            .frames()
            .iter()
            .filter_map(|frame| {
                let result = alignment.get(frame.id)?;
                let inverse = result.transform.inverse()?;
                Some((frame.as_ref(), inverse, result.confidence))
            })
            .collect();

        let area = region.ext_area();
        let mut pixels = vec![0.0f32; area * 3];
        let mut counts = vec![0u16; area];

        let s = self.scale as f32;
        let reference = set.reference();

        let mut samples: Vec<([f32; 3], f32)> = Vec::with_capacity(contributors.len());
        let mut channel: Vec<(f32, f32)> = Vec::with_capacity(contributors.len());

        let mut covered = 0usize;
        let mut contribution_total = 0u64;
        let mut confidence_total = 0.0f64;
        let mut confidence_samples = 0u64;

        for py in 0..region.ext_height {
            let oy = (region.ext_y + py) as f32 / s;
            for px in 0..region.ext_width {
                let ox = (region.ext_x + px) as f32 / s;

                samples.clear();
                for (frame, inverse, confidence) in &contributors {
                    let (fx, fy) = inverse.apply(ox, oy);
                    if let Some(rgb) = sample_bilinear_rgb(frame.image(), fx, fy) {
                        samples.push((rgb, *confidence));
                    }
                }

                let idx = (py * region.ext_width + px) as usize;
                counts[idx] = samples.len() as u16;

                if samples.is_empty() {
                    continue;
                }

                covered += 1;
                contribution_total += samples.len() as u64;
                for (_, c) in &samples {
                    confidence_total += *c as f64;
                }
                confidence_samples += samples.len() as u64;

                for c in 0..3 {
                    channel.clear();
                    channel.extend(samples.iter().map(|(rgb, w)| (rgb[c], *w)));
                    pixels[idx * 3 + c] = self.robust_estimate(&mut channel);
                }
            }
        }

        let filled = fill_gaps(&mut pixels, &counts, region.ext_width, region.ext_height);

        // Anything still uncovered sits outside every frame; take the
        // upsampled reference value.
        for py in 0..region.ext_height {
            for px in 0..region.ext_width {
                let idx = (py * region.ext_width + px) as usize;
                if !filled[idx] {
                    let rx = ((region.ext_x + px) as f32 / s)
                        .clamp(0.0, reference.width() as f32 - 1.0);
                    let ry = ((region.ext_y + py) as f32 / s)
                        .clamp(0.0, reference.height() as f32 - 1.0);
                    if let Some(rgb) = sample_bilinear_rgb(reference.image(), rx, ry) {
                        pixels[idx * 3..idx * 3 + 3].copy_from_slice(&rgb);
                    }
                }
            }
        }

        let stats = TileStats {
            mean_contribution: contribution_total as f32 / area as f32,
            coverage: covered as f32 / area as f32,
            mean_confidence: if confidence_samples > 0 {
                (confidence_total / confidence_samples as f64) as f32
            } else {
                0.0
            },
        };

        FinishedTile {
            region: *region,
            pixels,
            counts,
            stats,
        }
    }

    /// Weighted-median seed, then bounded-influence IRLS.
    fn robust_estimate(&self, samples: &mut [(f32, f32)]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        if samples.len() == 1 {
            return samples[0].0;
        }

        let seed = weighted_median(samples);

        // Residual spread sets the scale of the influence function.
        let mut deviations: Vec<f32> = samples.iter().map(|(v, _)| (v - seed).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let spread = (deviations[deviations.len() / 2] * 1.4826).max(MIN_SPREAD);

        let mut estimate = seed;
        for _ in 0..self.irls_iterations {
            let mut weight_sum = 0.0f32;
            let mut value_sum = 0.0f32;
            for &(v, confidence) in samples.iter() {
                let w = confidence * self.loss.weight((v - estimate) / spread);
                weight_sum += w;
                value_sum += w * v;
            }
            if weight_sum <= 1e-6 {
                return seed;
            }
            estimate = value_sum / weight_sum;
        }
        estimate
    }
}

/// Fill uncovered pixels from their 8-connected covered neighbors, a few
/// passes at most. Returns the coverage mask after filling; holes left
/// `false` fall back to the reference sample.
fn fill_gaps(pixels: &mut [f32], counts: &[u16], width: u32, height: u32) -> Vec<bool> {
    let mut filled: Vec<bool> = counts.iter().map(|&c| c > 0).collect();

    let mut gaps: Vec<(u32, u32)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            if counts[(y * width + x) as usize] == 0 {
                gaps.push((x, y));
            }
        }
    }
    if gaps.is_empty() {
        return filled;
    }

    for _ in 0..3 {
        if gaps.is_empty() {
            break;
        }
        let snapshot = filled.clone();
        let mut remaining = Vec::new();

        for &(x, y) in &gaps {
            let mut sum = [0.0f32; 3];
            let mut weight = 0.0f32;

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let nidx = (ny as u32 * width + nx as u32) as usize;
                    if snapshot[nidx] {
                        let w = 1.0 / ((dx * dx + dy * dy) as f32).sqrt();
                        for c in 0..3 {
                            sum[c] += pixels[nidx * 3 + c] * w;
                        }
                        weight += w;
                    }
                }
            }

            let idx = (y * width + x) as usize;
            if weight > 0.0 {
                for c in 0..3 {
                    pixels[idx * 3 + c] = sum[c] / weight;
                }
                filled[idx] = true;
            } else {
                remaining.push((x, y));
            }
        }

        gaps = remaining;
    }

    filled
}
