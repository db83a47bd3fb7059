use crate::convolve::{map_coord, BorderMode};
use burst_core::PlanarTransform;
use image::{GrayImage, RgbImage};
use rayon::prelude::*;

fn sample_pixel(img: &GrayImage, x: isize, y: isize, border: BorderMode) -> f32 {
    let width = img.width() as usize;
    let height = img.height() as usize;
    let raw = img.as_raw();

    match (map_coord(x, width, border), map_coord(y, height, border)) {
        (Some(ix), Some(iy)) => raw[iy * width + ix] as f32,
        _ => match border {
            BorderMode::Constant(v) => v as f32,
            _ => 0.0,
        },
    }
}

pub fn get_pixel_bilinear(img: &GrayImage, x: f32, y: f32) -> f32 {
    get_pixel_bilinear_with_border(img, x, y, BorderMode::Constant(0))
}

pub fn get_pixel_bilinear_with_border(
    img: &GrayImage,
    x: f32,
    y: f32,
    border: BorderMode,
) -> f32 {
    let x0 = x.floor() as isize;
    let y0 = y.floor() as isize;

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v00 = sample_pixel(img, x0, y0, border);
    let v10 = sample_pixel(img, x0 + 1, y0, border);
    let v01 = sample_pixel(img, x0, y0 + 1, border);
    let v11 = sample_pixel(img, x0 + 1, y0 + 1, border);

    let v0 = v00 * (1.0 - fx) + v10 * fx;
    let v1 = v01 * (1.0 - fx) + v11 * fx;

    v0 * (1.0 - fy) + v1 * fy
}

/// Bilinear RGB sample, `None` outside the valid interpolation footprint.
///
/// Fusion treats out-of-frame samples as missing contributions rather than
/// black bleed, so the boundary check is strict.
pub fn sample_bilinear_rgb(img: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let w = img.width() as f32;
    let h = img.height() as f32;
    if x > w - 1.0 || y > h - 1.0 {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let v0 = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let v1 = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = v0 * (1.0 - fy) + v1 * fy;
    }
    Some(out)
}

/// Warp `src` so that `dst(x, y) = src(transform^-1 (x, y))`.
///
/// `transform` maps source coordinates into destination coordinates; the
/// warp walks destination pixels through the inverse.
pub fn warp_perspective(
    src: &GrayImage,
    transform: &PlanarTransform,
    width: u32,
    height: u32,
) -> GrayImage {
    let inv = transform.inverse().unwrap_or(*transform);
    let mut dst = GrayImage::new(width, height);

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as f32;
            for x in 0..width {
                let (sx, sy) = inv.apply(x as f32, y);
                let val = get_pixel_bilinear(src, sx, sy);
                row[x as usize] = val.clamp(0.0, 255.0) as u8;
            }
        });

    dst
}
