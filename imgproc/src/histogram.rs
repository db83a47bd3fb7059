use image::GrayImage;

pub fn compute_histogram(image: &GrayImage) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for pixel in image.pixels() {
        hist[pixel[0] as usize] += 1;
    }
    hist
}

pub fn compute_histogram_normalized(image: &GrayImage) -> [f32; 256] {
    let hist = compute_histogram(image);
    let total = (image.width() * image.height()).max(1);
    hist.map(|h| h as f32 / total as f32)
}

/// L1 distance between two normalized histograms, in [0, 2].
pub fn histogram_l1_distance(a: &[f32; 256], b: &[f32; 256]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Per-bin median across a set of normalized histograms.
pub fn median_histogram(histograms: &[[f32; 256]]) -> [f32; 256] {
    let mut median = [0.0f32; 256];
    if histograms.is_empty() {
        return median;
    }

    let mut bin = Vec::with_capacity(histograms.len());
    for (i, m) in median.iter_mut().enumerate() {
        bin.clear();
        bin.extend(histograms.iter().map(|h| h[i]));
        bin.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        *m = bin[bin.len() / 2];
    }
    median
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn normalized_histogram_sums_to_one() {
        let mut img = GrayImage::new(10, 10);
        img.put_pixel(0, 0, Luma([200]));
        let h = compute_histogram_normalized(&img);
        let sum: f32 = h.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_histograms_have_zero_distance() {
        let img = GrayImage::new(8, 8);
        let h = compute_histogram_normalized(&img);
        assert_eq!(histogram_l1_distance(&h, &h), 0.0);
    }

    #[test]
    fn distance_grows_with_exposure_shift() {
        let dark = GrayImage::new(8, 8);
        let mut mid = GrayImage::new(8, 8);
        for p in mid.pixels_mut() {
            *p = Luma([128]);
        }
        let hd = compute_histogram_normalized(&dark);
        let hm = compute_histogram_normalized(&mid);
        assert!(histogram_l1_distance(&hd, &hm) > 1.0);
    }

    #[test]
    fn median_histogram_follows_majority() {
        let mut bright = [0.0f32; 256];
        bright[250] = 1.0;
        let mut dark = [0.0f32; 256];
        dark[5] = 1.0;

        let median = median_histogram(&[bright, bright, dark]);
        assert_eq!(median[250], 1.0);
        assert_eq!(median[5], 0.0);
    }
}
