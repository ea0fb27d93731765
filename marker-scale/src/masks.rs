//! Binary mask construction (fixed, Otsu, adaptive and edge masks), mask algebra,
//! morphology wrappers and contour extraction. Masks are `GrayImage`s holding 0 or 255.

use image::{GrayImage, Luma};
use image::imageops::replace;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::{close, dilate, open};

use crate::geometry::Coord;
use crate::normalize::{blur, median};

const ON: u8 = 255;

/// Which side of the threshold becomes foreground.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    /// Pixels above the threshold are set.
    Bright,
    /// Pixels at or below the threshold are set.
    Dark,
}

fn select(v: u8, threshold: f32, polarity: Polarity) -> u8 {
    let above = v as f32 > threshold;
    match (polarity, above) {
        (Polarity::Bright, true) | (Polarity::Dark, false) => ON,
        _ => 0,
    }
}

pub fn threshold(gray: &GrayImage, level: u8, polarity: Polarity) -> GrayImage {
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        Luma([select(gray.get_pixel(x, y)[0], level as f32, polarity)])
    })
}

/// Threshold at the Otsu level; returns the mask and the level.
pub fn otsu_threshold(gray: &GrayImage, polarity: Polarity) -> (GrayImage, u8) {
    let level = otsu_level(gray);
    (threshold(gray, level, polarity), level)
}

/// Gaussian-weighted adaptive threshold: compare every pixel with its local weighted
/// mean minus `c` over a `block x block` neighbourhood.
pub fn adaptive_threshold(gray: &GrayImage, block: u32, c: f32, polarity: Polarity) -> GrayImage {
    let block = block.max(3) | 1;
    // sigma OpenCV derives for a kernel of this size
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let local = blur(gray, sigma);
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let t = local.get_pixel(x, y)[0] as f32 - c;
        Luma([select(gray.get_pixel(x, y)[0], t, polarity)])
    })
}

/// Canny with thresholds derived from the median intensity.
pub fn auto_canny(gray: &GrayImage, sigma: f32) -> GrayImage {
    let v = median(gray) as f32;
    let lower = ((1.0 - sigma) * v).max(0.0);
    let upper = ((1.0 + sigma) * v).min(255.0).max(lower);
    canny(gray, lower, upper)
}

pub fn edges(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    canny(gray, low, high.max(low))
}

/// Pixel-wise OR of two equally sized masks.
pub fn union(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let (w, h) = a.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        Luma([a.get_pixel(x, y)[0].max(b.get_pixel(x, y)[0])])
    })
}

pub fn count_nonzero(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] != 0).count()
}

/// Closing with a square element of the given radius; radius 0 is a no-op.
pub fn close_square(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    close(mask, Norm::LInf, radius)
}

pub fn open_square(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    open(mask, Norm::LInf, radius)
}

pub fn dilate_square(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    dilate(mask, Norm::LInf, radius)
}

/// Contours of `mask` traced on a copy with a one-pixel empty frame, so components
/// touching the image edge still get an outer border. Points are in `mask` coordinates.
fn framed_contours(mask: &GrayImage) -> Vec<Contour<i32>> {
    let (w, h) = mask.dimensions();
    let mut framed = GrayImage::new(w + 2, h + 2);
    replace(&mut framed, mask, 1, 1);
    find_contours::<i32>(&framed)
        .into_iter()
        .map(|mut c| {
            c.points.iter_mut().for_each(|p| {
                p.x -= 1;
                p.y -= 1;
            });
            c
        })
        .collect()
}

/// Outer borders of the top-level foreground components.
pub fn external_contours(mask: &GrayImage) -> Vec<Vec<Coord>> {
    framed_contours(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| c.points.into_iter().map(Coord::from).collect())
        .collect()
}

/// Outer borders of every foreground component, including components nested in holes.
pub fn outer_contours(mask: &GrayImage) -> Vec<Vec<Coord>> {
    framed_contours(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .map(|c| c.points.into_iter().map(Coord::from).collect())
        .collect()
}
