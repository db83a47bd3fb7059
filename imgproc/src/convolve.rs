use image::GrayImage;
use rayon::prelude::*;
use wide::f32x8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    Constant(u8),
    Replicate,
    Reflect101,
}

pub(crate) fn map_coord(coord: isize, len: usize, mode: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }

    match mode {
        BorderMode::Constant(_) => {
            if coord < 0 || coord >= n {
                None
            } else {
                Some(coord as usize)
            }
        }
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
        BorderMode::Reflect101 => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * n - 2;
            let mut c = coord % period;
            if c < 0 {
                c += period;
            }
            if c >= n {
                c = period - c;
            }
            Some(c as usize)
        }
    }
}

pub fn gaussian_kernel_1d(sigma: f32, size: usize) -> Vec<f32> {
    assert!(size % 2 == 1, "gaussian kernel size must be odd");
    let mut kernel = Vec::with_capacity(size);
    let center = (size / 2) as isize;
    let sigma2 = sigma * sigma;
    let mut sum = 0.0f32;

    for i in 0..size {
        let x = (i as isize - center) as f32;
        let v = (-(x * x) / (2.0 * sigma2)).exp();
        kernel.push(v);
        sum += v;
    }

    if sum != 0.0 {
        for v in &mut kernel {
            *v /= sum;
        }
    }

    kernel
}

pub fn separable_convolve(image: &GrayImage, kernel_1d: &[f32], border: BorderMode) -> GrayImage {
    assert!(kernel_1d.len() % 2 == 1, "kernel size must be odd");

    let width = image.width() as usize;
    let height = image.height() as usize;
    let r = kernel_1d.len() / 2;
    let src = image.as_raw();

    let mut out = GrayImage::new(image.width(), image.height());
    if width == 0 || height == 0 {
        return out;
    }

    let mut tmp: Vec<f32> = vec![0.0f32; width * height];

    // Horizontal pass
    tmp.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            let row_offset = y * width;
            for (x, out_px) in row_out.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for (k, &w) in kernel_1d.iter().enumerate() {
                    let sx = x as isize + k as isize - r as isize;
                    let val = match map_coord(sx, width, border) {
                        Some(ix) => src[row_offset + ix] as f32,
                        None => match border {
                            BorderMode::Constant(v) => v as f32,
                            _ => 0.0,
                        },
                    };
                    sum += val * w;
                }
                *out_px = sum;
            }
        });

    // Vertical pass, 8 columns at a time
    out.as_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            let mut x = 0;
            while x + 8 <= width {
                let mut sum_v = f32x8::ZERO;
                for (k, &w) in kernel_1d.iter().enumerate() {
                    let sy = y as isize + k as isize - r as isize;
                    let mut vals = [0.0f32; 8];
                    if let Some(iy) = map_coord(sy, height, border) {
                        let idx = iy * width + x;
                        vals.copy_from_slice(&tmp[idx..idx + 8]);
                    } else if let BorderMode::Constant(v) = border {
                        vals = [v as f32; 8];
                    }
                    sum_v += f32x8::from(vals) * f32x8::splat(w);
                }
                let res: [f32; 8] = sum_v.into();
                for i in 0..8 {
                    row_out[x + i] = res[i].clamp(0.0, 255.0) as u8;
                }
                x += 8;
            }

            for cx in x..width {
                let mut sum = 0.0;
                for (k, &w) in kernel_1d.iter().enumerate() {
                    let sy = y as isize + k as isize - r as isize;
                    let val = match map_coord(sy, height, border) {
                        Some(iy) => tmp[iy * width + cx],
                        None => match border {
                            BorderMode::Constant(v) => v as f32,
                            _ => 0.0,
                        },
                    };
                    sum += val * w;
                }
                row_out[cx] = sum.clamp(0.0, 255.0) as u8;
            }
        });

    out
}

pub fn gaussian_blur(image: &GrayImage, sigma: f32) -> GrayImage {
    let size = ((sigma * 6.0).ceil() as usize) | 1;
    let kernel = gaussian_kernel_1d(sigma, size);
    separable_convolve(image, &kernel, BorderMode::Reflect101)
}

/// 3x3 Laplacian response as a signed f32 plane.
///
/// High-frequency energy of this plane is the blur metric used by the frame
/// gate and the detail-gain measure used by the validator.
pub fn laplacian_response(image: &GrayImage) -> Vec<f32> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let src = image.as_raw();
    let mut out = vec![0.0f32; width * height];

    if width == 0 || height == 0 {
        return out;
    }

    let fetch = |x: isize, y: isize| -> f32 {
        let ix = map_coord(x, width, BorderMode::Replicate).unwrap_or(0);
        let iy = map_coord(y, height, BorderMode::Replicate).unwrap_or(0);
        src[iy * width + ix] as f32
    };

    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let y = y as isize;
        for (x, out_px) in row.iter_mut().enumerate() {
            let x = x as isize;
            *out_px = fetch(x - 1, y) + fetch(x + 1, y) + fetch(x, y - 1) + fetch(x, y + 1)
                - 4.0 * fetch(x, y);
        }
    });

    out
}

/// Variance of the Laplacian response; higher means sharper.
pub fn laplacian_variance(image: &GrayImage) -> f32 {
    let response = laplacian_response(image);
    if response.is_empty() {
        return 0.0;
    }

    let n = response.len() as f32;
    let mean: f32 = response.iter().sum::<f32>() / n;
    response.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n
}

/// Mean absolute Laplacian response; the validator's high-frequency energy.
pub fn mean_abs_laplacian(image: &GrayImage) -> f32 {
    let response = laplacian_response(image);
    if response.is_empty() {
        return 0.0;
    }
    response.iter().map(|v| v.abs()).sum::<f32>() / response.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn gaussian_kernel_1d_is_normalized() {
        let k = gaussian_kernel_1d(1.2, 7);
        let sum: f32 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn gaussian_blur_preserves_size_and_spreads_impulse() {
        let mut img = GrayImage::new(33, 21);
        img.put_pixel(16, 10, Luma([255]));

        let out = gaussian_blur(&img, 1.0);
        assert_eq!(out.width(), img.width());
        assert_eq!(out.height(), img.height());
        assert!(out.get_pixel(16, 10)[0] < 255);
        assert!(out.get_pixel(15, 10)[0] > 0);
    }

    #[test]
    fn laplacian_variance_ranks_sharp_above_blurred() {
        let mut sharp = GrayImage::new(64, 64);
        for y in 0..64 {
            for x in 0..64 {
                let v = if (x / 4 + y / 4) % 2 == 0 { 230 } else { 25 };
                sharp.put_pixel(x, y, Luma([v]));
            }
        }
        let blurred = gaussian_blur(&sharp, 2.0);

        assert!(laplacian_variance(&sharp) > laplacian_variance(&blurred) * 2.0);
    }

    #[test]
    fn laplacian_of_flat_image_is_zero() {
        let mut img = GrayImage::new(16, 16);
        for p in img.pixels_mut() {
            *p = Luma([77]);
        }
        assert_eq!(laplacian_variance(&img), 0.0);
        assert_eq!(mean_abs_laplacian(&img), 0.0);
    }

    #[test]
    fn reflect101_maps_edges_inward() {
        assert_eq!(map_coord(-1, 10, BorderMode::Reflect101), Some(1));
        assert_eq!(map_coord(10, 10, BorderMode::Reflect101), Some(8));
        assert_eq!(map_coord(-1, 10, BorderMode::Constant(0)), None);
        assert_eq!(map_coord(-3, 10, BorderMode::Replicate), Some(0));
    }
}
