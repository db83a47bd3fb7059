//! Per-tile refinement
//!
//! Optional denoise and sharpening pass over a fused tile. Works strictly on
//! the tile's own overlap-inclusive pixels so that stitched seams stay
//! continuous, and never touches the contribution counts.

use crate::accumulate::FinishedTile;

#[derive(Debug, Clone)]
pub struct RefineStage {
    /// Denoise strength; actual blend per pixel is scaled by the inverse
    /// contribution count, so well-supported pixels stay crisp.
    pub denoise: f32,
    /// Unsharp gain at strong edges.
    pub sharpen: f32,
    /// Gradient magnitude at which sharpening reaches full gain.
    pub edge_threshold: f32,
    /// Hard cap on the sharpening delta, bounding halos at tile seams.
    pub max_delta: f32,
}

impl Default for RefineStage {
    fn default() -> Self {
        Self {
            denoise: 0.6,
            sharpen: 0.5,
            edge_threshold: 24.0,
            max_delta: 28.0,
        }
    }
}

impl RefineStage {
    /// Refine a fused tile in place.
    pub fn refine(&self, tile: &mut FinishedTile) {
        let width = tile.region.ext_width as usize;
        let height = tile.region.ext_height as usize;
        if width < 3 || height < 3 {
            return;
        }

        let blurred = box_blur3(&tile.pixels, width, height);

        // Denoise toward the local average, weighted by how few frames
        // backed each pixel.
        for idx in 0..width * height {
            let count = tile.counts[idx] as f32;
            let alpha = (self.denoise / (1.0 + count)).clamp(0.0, 1.0);
            for c in 0..3 {
                let i = idx * 3 + c;
                tile.pixels[i] += (blurred[i] - tile.pixels[i]) * alpha;
            }
        }

        // Edge-aware unsharp on the denoised plane.
        let base = box_blur3(&tile.pixels, width, height);
        let luma = luma_plane(&tile.pixels, width, height);

        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;

                let xm = x.saturating_sub(1);
                let xp = (x + 1).min(width - 1);
                let ym = y.saturating_sub(1);
                let yp = (y + 1).min(height - 1);
                let gx = (luma[y * width + xp] - luma[y * width + xm]) / 2.0;
                let gy = (luma[yp * width + x] - luma[ym * width + x]) / 2.0;
                let gradient = (gx * gx + gy * gy).sqrt();

                let gain = self.sharpen * (gradient / self.edge_threshold).min(1.0);
                if gain <= 0.0 {
                    continue;
                }

                for c in 0..3 {
                    let i = idx * 3 + c;
                    let high = tile.pixels[i] - base[i];
                    let delta = (gain * high).clamp(-self.max_delta, self.max_delta);
                    tile.pixels[i] = (tile.pixels[i] + delta).clamp(0.0, 255.0);
                }
            }
        }
    }
}

fn luma_plane(pixels: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut luma = vec![0.0f32; width * height];
    for (idx, l) in luma.iter_mut().enumerate() {
        *l = 0.299 * pixels[idx * 3] + 0.587 * pixels[idx * 3 + 1] + 0.114 * pixels[idx * 3 + 2];
    }
    luma
}

/// 3x3 box blur over an interleaved RGB plane, edges replicated.
fn box_blur3(pixels: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let mut sum = [0.0f32; 3];
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = (x as i64 + dx).clamp(0, width as i64 - 1) as usize;
                    let ny = (y as i64 + dy).clamp(0, height as i64 - 1) as usize;
                    let nidx = (ny * width + nx) * 3;
                    for c in 0..3 {
                        sum[c] += pixels[nidx + c];
                    }
                }
            }
            let idx = (y * width + x) * 3;
            for c in 0..3 {
                out[idx + c] = sum[c] / 9.0;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileRegion;
    use crate::TileStats;

    fn test_tile(width: u32, height: u32, counts: u16) -> FinishedTile {
        let region = TileRegion {
            index: 0,
            x: 0,
            y: 0,
            width,
            height,
            ext_x: 0,
            ext_y: 0,
            ext_width: width,
            ext_height: height,
        };
        let area = (width * height) as usize;
        let mut pixels = vec![100.0f32; area * 3];
        // Vertical step edge plus one noisy pixel.
        for y in 0..height as usize {
            for x in width as usize / 2..width as usize {
                let idx = (y * width as usize + x) * 3;
                pixels[idx] = 200.0;
                pixels[idx + 1] = 200.0;
                pixels[idx + 2] = 200.0;
            }
        }
        let noisy = (3 * width as usize / 4) + width as usize * 2;
        pixels[noisy * 3] = 230.0;

        FinishedTile {
            region,
            pixels,
            counts: vec![counts; area],
            stats: TileStats::default(),
        }
    }

    #[test]
    fn refine_preserves_counts_and_dimensions() {
        let mut tile = test_tile(16, 16, 3);
        let before = tile.counts.clone();
        RefineStage::default().refine(&mut tile);
        assert_eq!(tile.counts, before);
        assert_eq!(tile.pixels.len(), 16 * 16 * 3);
    }

    #[test]
    fn low_count_pixels_are_denoised_harder() {
        let mut weak = test_tile(16, 16, 1);
        let mut strong = test_tile(16, 16, 8);
        RefineStage::default().refine(&mut weak);
        RefineStage::default().refine(&mut strong);

        // The lone hot pixel flattens more when contributions are scarce.
        let noisy = ((3 * 16 / 4) + 16 * 2) * 3;
        let weak_dev = (weak.pixels[noisy] - 200.0).abs();
        let strong_dev = (strong.pixels[noisy] - 200.0).abs();
        assert!(weak_dev < strong_dev);
    }

    #[test]
    fn sharpening_delta_is_bounded() {
        let stage = RefineStage::default();
        let mut tile = test_tile(24, 24, 4);
        let before = tile.pixels.clone();
        stage.refine(&mut tile);

        for (a, b) in tile.pixels.iter().zip(before.iter()) {
            // denoise can only move toward the 3x3 mean; the sharpen delta
            // is capped, so total movement stays modest.
            assert!((a - b).abs() <= 100.0 + stage.max_delta);
            assert!(*a >= 0.0 && *a <= 255.0);
        }
    }

    #[test]
    fn flat_regions_stay_flat() {
        let region = TileRegion {
            index: 0,
            x: 0,
            y: 0,
            width: 8,
            height: 8,
            ext_x: 0,
            ext_y: 0,
            ext_width: 8,
            ext_height: 8,
        };
        let mut tile = FinishedTile {
            region,
            pixels: vec![120.0; 8 * 8 * 3],
            counts: vec![4; 8 * 8],
            stats: TileStats::default(),
        };
        RefineStage::default().refine(&mut tile);
        for p in &tile.pixels {
            assert!((p - 120.0).abs() < 1e-3);
        }
    }
}
