//! Marker pattern checks: a bright ring around the candidate and a grid of bright
//! squares nested inside it.

use image::GrayImage;
use itertools::Itertools;

use crate::config::PatternParams;
use crate::geometry::{polygon_area, Coord, Region};
use crate::masks::{adaptive_threshold, close_square, open_square, otsu_threshold, outer_contours, union, Polarity};
use crate::normalize::{blur, clahe, mean_intensity};
use crate::utils::ImageUtil;

const PATTERN_BLUR_SIGMA: f32 = 1.1;
const PATTERN_GRID: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternVerdict {
    Accepted,
    NoBorder,
    NoPattern,
}

impl PatternVerdict {
    pub fn is_accepted(&self) -> bool {
        *self == PatternVerdict::Accepted
    }
}

pub struct PatternValidator<'a> {
    params: &'a PatternParams,
}

impl<'a> PatternValidator<'a> {
    pub fn new(params: &'a PatternParams) -> PatternValidator<'a> {
        PatternValidator { params }
    }

    pub fn has_calibration_pattern(&self, gray: &GrayImage, candidate: &Region) -> bool {
        self.check(gray, candidate).is_accepted()
    }

    /// Run the enabled checks in order, border first.
    pub fn check(&self, gray: &GrayImage, candidate: &Region) -> PatternVerdict {
        if self.params.check_border && !self.white_border(gray, candidate).0 {
            return PatternVerdict::NoBorder;
        }
        if self.params.check_pattern && self.bright_squares(gray, candidate) < self.params.min_squares {
            return PatternVerdict::NoPattern;
        }
        PatternVerdict::Accepted
    }

    /// Whether the ring around `candidate` is bright and brighter than its interior.
    /// Also returns the ring brightness in `[0, 1]`.
    pub fn white_border(&self, gray: &GrayImage, candidate: &Region) -> (bool, f64) {
        let (width, height) = gray.dimensions();
        let inner = candidate.clamp_to(width, height);
        if inner.is_empty() {
            return (false, 0.0);
        }
        let bw = (candidate.w as f64 * self.params.border_ratio) as i32;
        let bh = (candidate.h as f64 * self.params.border_ratio) as i32;
        let outer = candidate.expand(bw, bh).clamp_to(width, height);

        let (mut sum, mut n) = (0u64, 0u64);
        for y in outer.y..outer.bottom() {
            for x in outer.x..outer.right() {
                let in_center = x >= inner.x && x < inner.right() && y >= inner.y && y < inner.bottom();
                if !in_center {
                    sum += gray.get_pixel(x as u32, y as u32)[0] as u64;
                    n += 1;
                }
            }
        }
        if n == 0 {
            return (false, 0.0);
        }
        let ring_mean = sum as f64 / n as f64;
        let center_mean = mean_intensity(&ImageUtil::crop(gray, &inner));
        let contrast = ring_mean - center_mean;
        let has_border = ring_mean > self.params.border_min_brightness
            && contrast > self.params.border_min_contrast;
        (has_border, (ring_mean / 255.0).min(1.0))
    }

    /// Number of near-square bright blobs inside `candidate`, plus one when three or more
    /// of them are evenly spaced.
    pub fn bright_squares(&self, gray: &GrayImage, candidate: &Region) -> usize {
        let roi = ImageUtil::crop(gray, candidate);
        let (w, h) = roi.dimensions();
        if w < 3 || h < 3 {
            return 0;
        }
        let enhanced = clahe(&blur(&roi, PATTERN_BLUR_SIGMA), self.params.pattern_clahe_clip, PATTERN_GRID);
        let (otsu, _) = otsu_threshold(&enhanced, Polarity::Bright);
        let block = self.params.pattern_min_block.max((w.min(h) / 8) | 1);
        let adaptive = adaptive_threshold(&enhanced, block, self.params.pattern_c, Polarity::Bright);
        let mask = open_square(&union(&otsu, &adaptive), 1);
        let mask = close_square(&mask, 1);

        let roi_area = (w * h) as f64;
        let (min_area, max_area) = (
            self.params.blob_min_frac * roi_area,
            self.params.blob_max_frac * roi_area,
        );
        let centers = outer_contours(&mask)
            .into_iter()
            .filter_map(|contour| {
                let area = polygon_area(&contour);
                if area < min_area || area > max_area {
                    return None;
                }
                let b = Region::bounding(&contour);
                // blobs touching the crop border belong to the surroundings
                if b.x <= 0 || b.y <= 0 || b.right() >= w as i32 || b.bottom() >= h as i32 {
                    return None;
                }
                let aspect = b.w.max(b.h) as f64 / b.w.min(b.h).max(1) as f64;
                if aspect > self.params.blob_max_aspect {
                    return None;
                }
                Some(Coord(b.x as f64 + b.w as f64 / 2.0, b.y as f64 + b.h as f64 / 2.0))
            })
            .collect_vec();

        let bonus = self.params.grid_bonus
            && centers.len() >= 3
            && evenly_spaced(&centers, self.params.grid_tolerance);
        centers.len() + usize::from(bonus)
    }
}

/// Nearest-neighbour spacings agree within `tolerance` (max / min).
fn evenly_spaced(centers: &[Coord], tolerance: f64) -> bool {
    let spacings = centers
        .iter()
        .enumerate()
        .map(|(i, a)| {
            centers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, b)| a.dist(b))
                .fold(f64::MAX, f64::min)
        })
        .collect_vec();
    let (lo, hi) = match spacings.iter().copied().minmax_by(|a, b| a.total_cmp(b)).into_option() {
        Some(pair) => pair,
        None => return false,
    };
    lo > 0.0 && hi / lo <= tolerance
}
