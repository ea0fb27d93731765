//! Intensity normalization shared by every detection stage: grayscale conversion,
//! Gaussian smoothing and contrast-limited adaptive histogram equalization (CLAHE).

use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use itertools::Itertools;
use ndarray::Array2;

/// Grayscale -> blur -> CLAHE.
#[derive(Clone, Debug, PartialEq)]
pub struct IntensityNormalizer {
    pub blur_sigma: f32,
    pub clip_limit: f32,
    pub grid: u32,
}

impl Default for IntensityNormalizer {
    fn default() -> Self {
        Self {
            blur_sigma: 1.1,
            clip_limit: 2.0,
            grid: 8,
        }
    }
}

impl IntensityNormalizer {
    pub fn new(blur_sigma: f32, clip_limit: f32, grid: u32) -> IntensityNormalizer {
        IntensityNormalizer {
            blur_sigma,
            clip_limit,
            grid,
        }
    }

    pub fn normalize(&self, gray: &GrayImage) -> GrayImage {
        let blurred = blur(gray, self.blur_sigma);
        clahe(&blurred, self.clip_limit, self.grid)
    }
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// Gaussian blur; a non-positive sigma returns a copy.
pub fn blur(gray: &GrayImage, sigma: f32) -> GrayImage {
    if sigma > 0.0 && gray.width() > 0 && gray.height() > 0 {
        gaussian_blur_f32(gray, sigma)
    } else {
        gray.clone()
    }
}

/// Convert to a `[row, col]` float array.
pub fn to_array(gray: &GrayImage) -> Array2<f32> {
    let (w, h) = gray.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(r, c)| {
        gray.get_pixel(c as u32, r as u32)[0] as f32
    })
}

pub fn mean_intensity(gray: &GrayImage) -> f64 {
    let n = gray.width() as u64 * gray.height() as u64;
    if n == 0 {
        return 0.0;
    }
    gray.pixels().map(|p| p[0] as u64).sum::<u64>() as f64 / n as f64
}

/// Median pixel value from the 256-bin histogram.
pub fn median(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    gray.pixels().for_each(|p| hist[p[0] as usize] += 1);
    let total: u64 = hist.iter().sum();
    let half = total.div_ceil(2);
    let mut acc = 0;
    for (v, count) in hist.iter().enumerate() {
        acc += count;
        if acc >= half && acc > 0 {
            return v as u8;
        }
    }
    0
}

fn tile_lut(hist: &mut [u32; 256], n: u32, clip_limit: f32) -> [u8; 256] {
    if clip_limit > 0.0 {
        let limit = ((clip_limit * n as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for count in hist.iter_mut() {
            if *count > limit {
                excess += *count - limit;
                *count = limit;
            }
        }
        let per_bin = excess / 256;
        let residual = excess - per_bin * 256;
        hist.iter_mut().for_each(|c| *c += per_bin);
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            hist.iter_mut()
                .step_by(step)
                .take(residual as usize)
                .for_each(|c| *c += 1);
        }
    }
    let scale = 255.0 / n.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (v, count) in hist.iter().enumerate() {
        cdf += count;
        lut[v] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Contrast-limited adaptive histogram equalization over a `grid x grid` tiling with
/// bilinear blending between neighbouring tile mappings.
pub fn clahe(gray: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tiles_x = grid.clamp(1, w);
    let tiles_y = grid.clamp(1, h);
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    let luts = (0..tiles_y)
        .cartesian_product(0..tiles_x)
        .map(|(ty, tx)| {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            let mut n = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                    n += 1;
                }
            }
            tile_lut(&mut hist, n, clip_limit)
        })
        .collect_vec();

    let lut_at = |tx: u32, ty: u32, v: u8| luts[(ty * tiles_x + tx) as usize][v as usize] as f32;
    let split = |pos: u32, size: u32, count: u32| -> (u32, u32, f32) {
        let f = (pos as f32 + 0.5) / size as f32 - 0.5;
        let lo = f.floor();
        let frac = f - lo;
        let t0 = (lo.max(0.0) as u32).min(count - 1);
        let t1 = ((lo + 1.0).max(0.0) as u32).min(count - 1);
        (t0, t1, if lo < 0.0 { 0.0 } else { frac })
    };

    GrayImage::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0];
        let (tx0, tx1, fx) = split(x, tile_w, tiles_x);
        let (ty0, ty1, fy) = split(y, tile_h, tiles_y);
        let top = lut_at(tx0, ty0, v) * (1.0 - fx) + lut_at(tx1, ty0, v) * fx;
        let bottom = lut_at(tx0, ty1, v) * (1.0 - fx) + lut_at(tx1, ty1, v) * fx;
        Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
    })
}

/// CLAHE blended with global histogram equalization: `(1 - w) * clahe + w * global`.
pub fn equalize_blend(gray: &GrayImage, clip_limit: f32, grid: u32, global_weight: f32) -> GrayImage {
    let local = clahe(gray, clip_limit, grid);
    if global_weight <= 0.0 {
        return local;
    }
    let global = equalize_histogram(gray);
    let wg = global_weight.clamp(0.0, 1.0);
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let a = local.get_pixel(x, y)[0] as f32;
        let b = global.get_pixel(x, y)[0] as f32;
        Luma([(a * (1.0 - wg) + b * wg).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::{clahe, median, to_array, IntensityNormalizer};
    use crate::synthetic::{render_scene, MarkerSpec};
    use image::{GrayImage, Luma};

    fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f64 {
        let total: u64 = a
            .pixels()
            .zip(b.pixels())
            .map(|(p, q)| (p[0] as i64 - q[0] as i64).unsigned_abs())
            .sum();
        total as f64 / (a.width() * a.height()) as f64
    }

    #[test]
    fn test_clahe_keeps_constant_white() {
        let img = GrayImage::from_pixel(64, 48, Luma([255]));
        let out = clahe(&img, 2.0, 8);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_clahe_preserves_order() {
        let img = GrayImage::from_fn(64, 64, |x, _| Luma([(x * 4) as u8]));
        let out = clahe(&img, 2.0, 4);
        let row = |x: u32| out.get_pixel(x, 32)[0];
        assert!(row(0) < row(20));
        assert!(row(20) < row(44));
        assert!(row(44) < row(63));
    }

    #[test]
    fn test_normalize_deterministic() {
        let scene = render_scene(200, 160, &[MarkerSpec::new(100.0, 80.0, 80.0, 0.0)]);
        let gray = image::imageops::grayscale(&scene);
        let normalizer = IntensityNormalizer::default();
        assert_eq!(normalizer.normalize(&gray), normalizer.normalize(&gray));
    }

    #[test]
    fn test_normalize_idempotent() {
        let scene = render_scene(240, 200, &[MarkerSpec::new(120.0, 100.0, 96.0, 10.0)]);
        let gray = image::imageops::grayscale(&scene);
        let normalizer = IntensityNormalizer::default();
        let once = normalizer.normalize(&gray);
        let twice = normalizer.normalize(&once);
        assert!(mean_abs_diff(&once, &twice) < 10.0);
    }

    #[test]
    fn test_median_and_array() {
        let img = GrayImage::from_fn(4, 1, |x, _| Luma([[10, 20, 200, 250][x as usize]]));
        assert_eq!(median(&img), 20);
        let arr = to_array(&img);
        assert_eq!(arr.dim(), (1, 4));
        assert_eq!(arr[[0, 2]], 200.0);
    }
}
