//! Tile stitching
//!
//! Composes committed tiles into the output canvas with a feathered ramp
//! across overlap margins. Tiles are always blended in tile-index order, so
//! the stitched image is independent of the order in which workers finished
//! them.

use crate::accumulate::FinishedTile;
use image::RgbImage;

/// Blend weight of a tile pixel: ramps from the extended edge inward across
/// the overlap margin, flat at 1 in the core.
fn feather_weight(local: u32, extent: u32, overlap: u32) -> f32 {
    if overlap == 0 {
        return 1.0;
    }
    let ramp = overlap as f32;
    let from_low = (local as f32 + 1.0) / ramp;
    let from_high = (extent - local) as f32 / ramp;
    from_low.min(from_high).min(1.0).max(0.05)
}

/// Stitch tiles into the final canvas.
///
/// `tiles` may arrive in any order; they are composed by ascending tile
/// index. Every canvas pixel must be covered by at least one tile's extended
/// region, which [`crate::TileGrid`] guarantees.
pub fn stitch(
    tiles: &[FinishedTile],
    output_width: u32,
    output_height: u32,
    overlap: u32,
) -> RgbImage {
    let area = output_width as usize * output_height as usize;
    let mut accum = vec![0.0f32; area * 3];
    let mut weights = vec![0.0f32; area];

    let mut order: Vec<&FinishedTile> = tiles.iter().collect();
    order.sort_by_key(|t| t.region.index);

    for tile in order {
        let r = &tile.region;
        for py in 0..r.ext_height {
            let wy = feather_weight(py, r.ext_height, overlap);
            let oy = (r.ext_y + py) as usize;
            for px in 0..r.ext_width {
                let w = feather_weight(px, r.ext_width, overlap).min(wy);
                let ox = (r.ext_x + px) as usize;

                let src = ((py * r.ext_width + px) * 3) as usize;
                let dst = oy * output_width as usize + ox;
                for c in 0..3 {
                    accum[dst * 3 + c] += tile.pixels[src + c] * w;
                }
                weights[dst] += w;
            }
        }
    }

    let mut out = RgbImage::new(output_width, output_height);
    for (idx, pixel) in out.pixels_mut().enumerate() {
        let w = weights[idx];
        if w > 0.0 {
            for c in 0..3 {
                pixel[c] = (accum[idx * 3 + c] / w).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}
