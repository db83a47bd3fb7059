use burst_core::PlanarTransform;
use burst_imgproc::*;
use image::{GrayImage, Luma, Rgb, RgbImage};

#[test]
fn resize_round_trip_keeps_content_location() {
    let mut img = GrayImage::new(100, 100);
    img.put_pixel(50, 50, Luma([255]));

    let up = resize(&img, 200, 200, Interpolation::Linear);
    assert_eq!(up.width(), 200);
    assert!(up.get_pixel(100, 100)[0] > 100);

    let down = resize(&up, 100, 100, Interpolation::Linear);
    assert_eq!(down.width(), 100);
}

#[test]
fn cubic_upscale_keeps_more_detail_than_it_invents() {
    let mut img = RgbImage::new(32, 32);
    for y in 0..32 {
        for x in 0..32 {
            let v = if (x / 2 + y / 2) % 2 == 0 { 210 } else { 40 };
            img.put_pixel(x, y, Rgb([v, v, v]));
        }
    }

    let up = resize_rgb(&img, 64, 64, Interpolation::Cubic);
    assert_eq!(up.width(), 64);

    // Values stay within a sane range of the source dynamic.
    for p in up.pixels() {
        assert!(p[0] >= 10 && p[0] <= 240);
    }
}

#[test]
fn warp_then_inverse_warp_is_near_identity() {
    let mut img = GrayImage::new(48, 48);
    for y in 0..48 {
        for x in 0..48 {
            img.put_pixel(x, y, Luma([((x * 5 + y * 3) % 256) as u8]));
        }
    }

    let t = PlanarTransform::from_translation(4.0, -3.0);
    let warped = warp_perspective(&img, &t, 48, 48);
    let back = warp_perspective(&warped, &t.inverse().unwrap(), 48, 48);

    // Interior pixels survive the round trip; borders lose data to the
    // constant fill.
    for y in 10..38 {
        for x in 10..38 {
            let a = img.get_pixel(x, y)[0] as i32;
            let b = back.get_pixel(x, y)[0] as i32;
            assert!((a - b).abs() <= 2, "({x},{y}): {a} vs {b}");
        }
    }
}

#[test]
fn blur_metric_orders_pyramid_levels() {
    let mut img = GrayImage::new(128, 128);
    for y in 0..128 {
        for x in 0..128 {
            let v = if (x / 3 + y / 3) % 2 == 0 { 220 } else { 30 };
            img.put_pixel(x, y, Luma([v]));
        }
    }

    let pyramid = build_pyramid(&img, 3);
    assert_eq!(pyramid.len(), 3);
    // Finest level carries the most high-frequency energy per pixel of its
    // checker pattern against its blurred descendants.
    let blurred = gaussian_blur(&pyramid[0], 2.0);
    assert!(laplacian_variance(&pyramid[0]) > laplacian_variance(&blurred));
}
