//! Tile scheduling
//!
//! The output canvas is partitioned into core regions with symmetric overlap
//! margins. One tile's full working set (per-frame source windows plus its
//! accumulation planes) must fit the device-tier ceiling; the grid builder
//! shrinks the tile edge until it does.

use crate::{FusionError, Result};
use burst_core::PlanarTransform;
use serde::{Deserialize, Serialize};

/// Smallest tile edge worth scheduling; below this the per-tile overhead
/// dwarfs the pixel work.
const MIN_TILE_EDGE: u32 = 32;

/// Padding around an inverse-mapped source window, covering bilinear taps
/// and the sub-pixel trim range.
const SOURCE_PAD: u32 = 2;

/// Device-tier memory constraints supplied by the capability probe.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    /// Ceiling for one tile's working set, in bytes.
    pub tile_working_set_bytes: usize,
    /// Concurrent tile workers the device can sustain.
    pub workers: usize,
}

/// Rectangular region of a source frame to decode for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One output tile: a core region plus the overlap-inclusive extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRegion {
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub ext_x: u32,
    pub ext_y: u32,
    pub ext_width: u32,
    pub ext_height: u32,
}

impl TileRegion {
    pub fn ext_area(&self) -> usize {
        self.ext_width as usize * self.ext_height as usize
    }

    /// Minimal source rectangle of a frame feeding this tile, found by
    /// inverse-mapping the overlap-inclusive corners through the frame's
    /// alignment. `None` when the tile sees nothing of the frame.
    pub fn source_window(
        &self,
        transform: &PlanarTransform,
        scale: u32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<SourceWindow> {
        let inv = transform.inverse()?;
        let s = scale as f32;

        let x0 = self.ext_x as f32 / s;
        let y0 = self.ext_y as f32 / s;
        let x1 = (self.ext_x + self.ext_width) as f32 / s;
        let y1 = (self.ext_y + self.ext_height) as f32 / s;

        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for &(cx, cy) in &[(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
            let (fx, fy) = inv.apply(cx, cy);
            min_x = min_x.min(fx);
            min_y = min_y.min(fy);
            max_x = max_x.max(fx);
            max_y = max_y.max(fy);
        }

        let min_x = (min_x.floor() as i64 - SOURCE_PAD as i64).max(0) as u32;
        let min_y = (min_y.floor() as i64 - SOURCE_PAD as i64).max(0) as u32;
        let max_x = ((max_x.ceil() as i64 + SOURCE_PAD as i64) as u32).min(frame_width);
        let max_y = ((max_y.ceil() as i64 + SOURCE_PAD as i64) as u32).min(frame_height);

        if min_x >= max_x || min_y >= max_y {
            return None;
        }

        Some(SourceWindow {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }
}

/// Bytes one tile needs live at once: a source window per frame (RGB u8),
/// the f32 accumulation plane and the u16 contribution plane.
pub fn tile_working_set_bytes(
    ext_width: u32,
    ext_height: u32,
    scale: u32,
    frame_count: usize,
) -> usize {
    let src_w = ext_width / scale + 2 * SOURCE_PAD;
    let src_h = ext_height / scale + 2 * SOURCE_PAD;
    let source = src_w as usize * src_h as usize * 3;
    let accumulation = ext_width as usize * ext_height as usize * (3 * 4 + 2);
    frame_count * source + accumulation
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    pub output_width: u32,
    pub output_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    tiles: Vec<TileRegion>,
}

impl TileGrid {
    /// Partition the output canvas into a raster-ordered tile worklist.
    pub fn build(
        output_width: u32,
        output_height: u32,
        tile_size: u32,
        overlap: u32,
    ) -> Result<Self> {
        if output_width == 0 || output_height == 0 {
            return Err(FusionError::InvalidGeometry(
                "output canvas must be non-empty".into(),
            ));
        }
        if tile_size < MIN_TILE_EDGE {
            return Err(FusionError::InvalidGeometry(format!(
                "tile size {tile_size} below minimum {MIN_TILE_EDGE}"
            )));
        }
        let overlap = overlap.min(tile_size / 2);

        let mut tiles = Vec::new();
        let mut y = 0u32;
        while y < output_height {
            let height = tile_size.min(output_height - y);
            let mut x = 0u32;
            while x < output_width {
                let width = tile_size.min(output_width - x);

                let ext_x = x.saturating_sub(overlap);
                let ext_y = y.saturating_sub(overlap);
                let ext_right = (x + width + overlap).min(output_width);
                let ext_bottom = (y + height + overlap).min(output_height);

                tiles.push(TileRegion {
                    index: tiles.len(),
                    x,
                    y,
                    width,
                    height,
                    ext_x,
                    ext_y,
                    ext_width: ext_right - ext_x,
                    ext_height: ext_bottom - ext_y,
                });

                x += tile_size;
            }
            y += tile_size;
        }

        Ok(Self {
            output_width,
            output_height,
            tile_size,
            overlap,
            tiles,
        })
    }

    /// Build a grid whose per-tile working set fits `budget`, halving the
    /// tile edge as needed.
    pub fn for_budget(
        output_width: u32,
        output_height: u32,
        tile_size: u32,
        overlap: u32,
        scale: u32,
        frame_count: usize,
        budget: &MemoryBudget,
    ) -> Result<Self> {
        let mut edge = tile_size.max(MIN_TILE_EDGE);

        loop {
            let ext = edge + 2 * overlap.min(edge / 2);
            let working_set = tile_working_set_bytes(ext, ext, scale, frame_count);
            if working_set <= budget.tile_working_set_bytes {
                log::debug!(
                    "tile edge {edge}px, working set {} KiB within {} KiB ceiling",
                    working_set / 1024,
                    budget.tile_working_set_bytes / 1024
                );
                return Self::build(output_width, output_height, edge, overlap.min(edge / 2));
            }
            if edge == MIN_TILE_EDGE {
                return Err(FusionError::MemoryPressure(format!(
                    "minimum tile needs {working_set} bytes, ceiling is {}",
                    budget.tile_working_set_bytes
                )));
            }
            edge = (edge / 2).max(MIN_TILE_EDGE);
        }
    }

    pub fn tiles(&self) -> &[TileRegion] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
