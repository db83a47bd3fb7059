use crate::Interpolation;
use image::{GrayImage, RgbImage};
use rayon::prelude::*;

pub fn resize(src: &GrayImage, width: u32, height: u32, interpolation: Interpolation) -> GrayImage {
    if width == 0 || height == 0 {
        return GrayImage::new(0, 0);
    }

    match interpolation {
        Interpolation::Nearest => resize_nearest(src, width, height),
        Interpolation::Linear => resize_linear(src, width, height),
        Interpolation::Cubic => resize_cubic(src, width, height),
    }
}

fn resize_nearest(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut dst = GrayImage::new(width, height);
    let sx = src.width() as f32 / width as f32;
    let sy = src.height() as f32 / height as f32;

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let srcy = ((y as f32 * sy).floor() as u32).min(src.height() - 1);
            for x in 0..width {
                let srcx = ((x as f32 * sx).floor() as u32).min(src.width() - 1);
                row[x as usize] = src.get_pixel(srcx, srcy)[0];
            }
        });
    dst
}

fn resize_linear(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut dst = GrayImage::new(width, height);
    let src_width = src.width() as f32 - 1.0;
    let src_height = src.height() as f32 - 1.0;
    let dst_width = (width.max(2) - 1) as f32;
    let dst_height = (height.max(2) - 1) as f32;

    if src_width <= 0.0 || src_height <= 0.0 {
        return dst;
    }

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let fy = (y as f32 / dst_height) * src_height;
            let y0 = fy as u32;
            let y1 = (y0 + 1).min(src.height() - 1);
            let dy = fy - y0 as f32;

            for x in 0..width {
                let fx = (x as f32 / dst_width) * src_width;
                let x0 = fx as u32;
                let x1 = (x0 + 1).min(src.width() - 1);
                let dx = fx - x0 as f32;

                let v00 = src.get_pixel(x0, y0)[0] as f32;
                let v10 = src.get_pixel(x1, y0)[0] as f32;
                let v01 = src.get_pixel(x0, y1)[0] as f32;
                let v11 = src.get_pixel(x1, y1)[0] as f32;

                let v0 = v00 * (1.0 - dx) + v10 * dx;
                let v1 = v01 * (1.0 - dx) + v11 * dx;
                let v = v0 * (1.0 - dy) + v1 * dy;

                row[x as usize] = v.clamp(0.0, 255.0) as u8;
            }
        });

    dst
}

/// Catmull-Rom cubic interpolation weight for a sample `t` pixels away.
pub fn cubic_weight(t: f32) -> f32 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

fn cubic_sample<F: Fn(i64, i64) -> f32>(fetch: F, fx: f32, fy: f32) -> f32 {
    let x0 = fx.floor() as i64;
    let y0 = fy.floor() as i64;
    let dx = fx - x0 as f32;
    let dy = fy - y0 as f32;

    let mut value = 0.0;
    let mut weight_sum = 0.0;
    for j in -1..=2i64 {
        let wy = cubic_weight(j as f32 - dy);
        if wy == 0.0 {
            continue;
        }
        for i in -1..=2i64 {
            let wx = cubic_weight(i as f32 - dx);
            if wx == 0.0 {
                continue;
            }
            let w = wx * wy;
            value += fetch(x0 + i, y0 + j) * w;
            weight_sum += w;
        }
    }

    if weight_sum.abs() > 1e-8 {
        value / weight_sum
    } else {
        fetch(x0, y0)
    }
}

fn resize_cubic(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut dst = GrayImage::new(width, height);
    let src_width = src.width() as f32 - 1.0;
    let src_height = src.height() as f32 - 1.0;
    let dst_width = (width.max(2) - 1) as f32;
    let dst_height = (height.max(2) - 1) as f32;

    if src_width <= 0.0 || src_height <= 0.0 {
        return dst;
    }

    let (sw, sh) = (src.width() as i64, src.height() as i64);
    let raw = src.as_raw();

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let fy = (y as f32 / dst_height) * src_height;
            for x in 0..width {
                let fx = (x as f32 / dst_width) * src_width;
                let v = cubic_sample(
                    |ix, iy| {
                        let cx = ix.clamp(0, sw - 1) as usize;
                        let cy = iy.clamp(0, sh - 1) as usize;
                        raw[cy * sw as usize + cx] as f32
                    },
                    fx,
                    fy,
                );
                row[x as usize] = v.clamp(0.0, 255.0) as u8;
            }
        });

    dst
}

pub fn resize_rgb(
    src: &RgbImage,
    width: u32,
    height: u32,
    interpolation: Interpolation,
) -> RgbImage {
    if width == 0 || height == 0 {
        return RgbImage::new(0, 0);
    }

    let src_width = src.width() as f32 - 1.0;
    let src_height = src.height() as f32 - 1.0;
    let dst_width = (width.max(2) - 1) as f32;
    let dst_height = (height.max(2) - 1) as f32;

    let mut dst = RgbImage::new(width, height);
    if src_width <= 0.0 || src_height <= 0.0 {
        return dst;
    }

    let (sw, sh) = (src.width() as i64, src.height() as i64);
    let raw = src.as_raw();
    let cubic = interpolation == Interpolation::Cubic;

    dst.as_mut()
        .par_chunks_mut(width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let fy = (y as f32 / dst_height) * src_height;
            for x in 0..width {
                let fx = (x as f32 / dst_width) * src_width;

                for c in 0..3usize {
                    let fetch = |ix: i64, iy: i64| {
                        let cx = ix.clamp(0, sw - 1) as usize;
                        let cy = iy.clamp(0, sh - 1) as usize;
                        raw[(cy * sw as usize + cx) * 3 + c] as f32
                    };

                    let v = if cubic {
                        cubic_sample(fetch, fx, fy)
                    } else {
                        let x0 = fx as i64;
                        let y0 = fy as i64;
                        let dx = fx - x0 as f32;
                        let dy = fy - y0 as f32;
                        let v0 = fetch(x0, y0) * (1.0 - dx) + fetch(x0 + 1, y0) * dx;
                        let v1 = fetch(x0, y0 + 1) * (1.0 - dx) + fetch(x0 + 1, y0 + 1) * dx;
                        v0 * (1.0 - dy) + v1 * dy
                    };

                    row[x as usize * 3 + c] = v.clamp(0.0, 255.0) as u8;
                }
            }
        });

    dst
}

pub fn pyr_down(src: &GrayImage) -> GrayImage {
    let new_width = src.width() / 2;
    let new_height = src.height() / 2;
    if new_width == 0 || new_height == 0 {
        return GrayImage::new(1, 1);
    }
    resize(src, new_width, new_height, Interpolation::Linear)
}

pub fn build_pyramid(src: &GrayImage, levels: u32) -> Vec<GrayImage> {
    let mut pyramid = vec![src.clone()];

    for _ in 1..levels {
        let prev = pyramid.last().unwrap();
        if prev.width() < 16 || prev.height() < 16 {
            break;
        }
        pyramid.push(pyr_down(prev));
    }

    pyramid
}
