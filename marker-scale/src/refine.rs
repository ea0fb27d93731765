//! Full-resolution quadrilateral re-extraction inside a candidate box and sub-pixel
//! corner localization.
//!
//! Corner refinement never fails hard: when no usable corner response is found, or the
//! iteration leaves its search window, the coarse corners are kept and the result is
//! tagged [`Precision::Fallback`].

use image::GrayImage;
use itertools::Itertools;
use ndarray::{s, Array2};
use ndarray_stats::QuantileExt;
use serde::Serialize;

use crate::config::RefinerParams;
use crate::filters::{box_sum, sobel, SOBEL_EAST, SOBEL_SOUTH};
use crate::geometry::{convex_hull, min_area_rect, polygon_area, Coord, Global, Local, Quad, Region};
use crate::masks::{close_square, edges, external_contours, open_square, otsu_threshold, union, Polarity};
use crate::normalize::{blur, clahe};
use crate::utils::ImageUtil;

const ROI_BLUR_SIGMA: f32 = 1.1;
const ROI_CLAHE_CLIP: f32 = 3.0;
const ROI_CLAHE_GRID: u32 = 8;
const CLOSE_RADIUS: u8 = 4;
const OPEN_RADIUS: u8 = 2;
const SEARCH_RADIUS_FRAC: f64 = 0.12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Corners moved to sub-pixel positions.
    Refined,
    /// Coarse corners kept.
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinedQuad {
    pub quad: Quad<Global>,
    pub precision: Precision,
}

impl RefinedQuad {
    fn fallback(quad: Quad<Global>) -> RefinedQuad {
        RefinedQuad {
            quad,
            precision: Precision::Fallback,
        }
    }
}

pub struct RegionRefiner<'a> {
    params: &'a RefinerParams,
}

impl<'a> RegionRefiner<'a> {
    pub fn new(params: &'a RefinerParams) -> RegionRefiner<'a> {
        RegionRefiner { params }
    }

    /// Fit a rotated rectangle to the dominant contour inside `candidate`, then try to
    /// move its vertices to sub-pixel corners. `None` when no contour passes the aspect
    /// and fill bounds.
    pub fn refine_quad(&self, gray: &GrayImage, candidate: &Region) -> Option<RefinedQuad> {
        let coarse = self.coarse_quad(gray, candidate)?;
        Some(self.refine_corners(gray, &coarse))
    }

    /// Rotated rectangle of the dominant contour inside `candidate`, without corner
    /// refinement.
    pub fn coarse_quad(&self, gray: &GrayImage, candidate: &Region) -> Option<Quad<Global>> {
        let region = candidate.clamp_to(gray.width(), gray.height());
        if region.w < 3 || region.h < 3 {
            return None;
        }
        let roi = ImageUtil::crop(gray, &region);
        let enhanced = clahe(&blur(&roi, ROI_BLUR_SIGMA), ROI_CLAHE_CLIP, ROI_CLAHE_GRID);
        let (binary, _) = otsu_threshold(&enhanced, Polarity::Dark);
        let edge_map = edges(&enhanced, self.params.canny_low, self.params.canny_high);
        let mask = close_square(&union(&binary, &edge_map), CLOSE_RADIUS);
        let mask = open_square(&mask, OPEN_RADIUS);

        let largest = external_contours(&mask)
            .into_iter()
            .map(|c| (polygon_area(&c), c))
            .max_by(|a, b| a.0.total_cmp(&b.0))?
            .1;
        let hull = convex_hull(&largest);
        let hull_area = polygon_area(&hull);
        if hull_area <= 0.0 {
            return None;
        }
        let (rect, long, short) = min_area_rect(&hull)?;
        if long / short.max(1e-3) > self.params.max_aspect {
            return None;
        }
        if hull_area / (long * short + 1e-6) < self.params.min_fill {
            return None;
        }

        let local: Quad<Local> = Quad::from_unordered(rect);
        Some(local.to_global(Coord(region.x as f64, region.y as f64), 1.0))
    }

    /// Move each coarse corner to the strongest Shi-Tomasi response within the search
    /// radius, then iterate to the sub-pixel saddle of the local gradient field.
    pub fn refine_corners(&self, gray: &GrayImage, coarse: &Quad<Global>) -> RefinedQuad {
        // keep the search clear of the inner pattern corners on small markers
        let cap = (coarse.mean_side() * SEARCH_RADIUS_FRAC).max(3.0) as i64;
        let radius = (self.params.corner_search_radius as i64).min(cap);
        let win = self.params.subpix_window as i64;
        let patches = coarse
            .corners()
            .iter()
            .map(|c| CornerPatch::new(gray, c, radius + win + 3))
            .collect_vec();

        let peaks = patches
            .iter()
            .map(|p| p.strongest_corner(radius as f64))
            .collect_vec();
        let strongest = peaks
            .iter()
            .flatten()
            .map(|(_, response)| *response)
            .fold(0.0f32, f32::max);
        if strongest <= 0.0 {
            return RefinedQuad::fallback(*coarse);
        }

        let mut refined = [Coord::default(); 4];
        for (i, (patch, peak)) in patches.iter().zip(&peaks).enumerate() {
            let (start, response) = match peak {
                Some(peak) => *peak,
                None => return RefinedQuad::fallback(*coarse),
            };
            if response < self.params.min_corner_quality * strongest {
                return RefinedQuad::fallback(*coarse);
            }
            let found = patch.subpixel(
                start,
                win,
                self.params.subpix_max_iter,
                self.params.subpix_eps,
                radius as f64 + 2.0,
            );
            match found {
                Some(p) => refined[i] = p,
                None => return RefinedQuad::fallback(*coarse),
            }
        }

        let quad = coarse.with_corners(refined);
        if !quad.is_convex() {
            return RefinedQuad::fallback(*coarse);
        }
        RefinedQuad {
            quad,
            precision: Precision::Refined,
        }
    }
}

/// Gradients of a square window around one coarse corner.
struct CornerPatch {
    /// Image position of element `[0, 0]`.
    origin: (i64, i64),
    center: Coord,
    east: Array2<f32>,
    south: Array2<f32>,
}

impl CornerPatch {
    fn new(gray: &GrayImage, center: &Coord, half: i64) -> CornerPatch {
        let (w, h) = (gray.width() as i64, gray.height() as i64);
        let origin = (center.0.round() as i64 - half, center.1.round() as i64 - half);
        let size = (2 * half + 1) as usize;
        let pixels = Array2::from_shape_fn((size, size), |(r, c)| {
            let x = (origin.0 + c as i64).clamp(0, w - 1);
            let y = (origin.1 + r as i64).clamp(0, h - 1);
            gray.get_pixel(x as u32, y as u32)[0] as f32
        });
        CornerPatch {
            origin,
            center: *center,
            east: sobel(&pixels, &SOBEL_EAST),
            south: sobel(&pixels, &SOBEL_SOUTH),
        }
    }

    fn to_image(&self, row: usize, col: usize) -> Coord {
        Coord((self.origin.0 + col as i64) as f64, (self.origin.1 + row as i64) as f64)
    }

    /// Minimum-eigenvalue corner response over 3x3 blocks.
    fn shi_tomasi(&self) -> Array2<f32> {
        let ixx = box_sum(&(&self.east * &self.east), 1);
        let iyy = box_sum(&(&self.south * &self.south), 1);
        let ixy = box_sum(&(&self.east * &self.south), 1);
        let mut response = Array2::zeros(ixx.dim());
        ndarray::Zip::from(&mut response)
            .and(&ixx)
            .and(&iyy)
            .and(&ixy)
            .for_each(|r, &a, &c, &b| {
                let half_trace = (a + c) / 2.0;
                let spread = (((a - c) / 2.0).powi(2) + b * b).sqrt();
                *r = half_trace - spread;
            });
        response
    }

    /// Image position and response of the strongest corner within `radius` of the center.
    fn strongest_corner(&self, radius: f64) -> Option<(Coord, f32)> {
        let mut response = self.shi_tomasi();
        let (rows, cols) = response.dim();
        for ((r, c), v) in response.indexed_iter_mut() {
            let frame = r < 2 || c < 2 || r + 2 >= rows || c + 2 >= cols;
            if frame || self.to_image(r, c).dist(&self.center) > radius {
                *v = 0.0;
            }
        }
        let (r, c) = response.argmax().ok()?;
        let value = response[[r, c]];
        (value > 0.0).then(|| (self.to_image(r, c), value))
    }

    /// Iterative corner refinement: the corner `q` is the point every gradient in the
    /// window is orthogonal to, `sum w g g^T (p - q) = 0`.
    fn subpixel(
        &self,
        start: Coord,
        win: i64,
        max_iter: usize,
        eps: f64,
        max_shift: f64,
    ) -> Option<Coord> {
        let (rows, cols) = self.east.dim();
        let mut q = start;
        let inv_win2 = 1.0 / (win * win).max(1) as f64;
        for _ in 0..max_iter {
            let (qc, qr) = (
                q.0.round() as i64 - self.origin.0,
                q.1.round() as i64 - self.origin.1,
            );
            if qc - win < 1 || qr - win < 1 || qc + win >= cols as i64 - 1 || qr + win >= rows as i64 - 1 {
                return None;
            }
            let (mut a11, mut a12, mut a22, mut b1, mut b2) = (0.0, 0.0, 0.0, 0.0, 0.0);
            let (r0, c0) = ((qr - win) as usize, (qc - win) as usize);
            let span = (2 * win) as usize;
            let east = self.east.slice(s![r0..=r0 + span, c0..=c0 + span]);
            let south = self.south.slice(s![r0..=r0 + span, c0..=c0 + span]);
            for ((idx, &gx), &gy) in east.indexed_iter().zip(south.iter()) {
                let p = self.to_image(r0 + idx.0, c0 + idx.1);
                let d = p.sub(&q);
                let weight = (-(d.0 * d.0 + d.1 * d.1) * inv_win2).exp();
                let (gx, gy) = (gx as f64, gy as f64);
                let (gxx, gxy, gyy) = (weight * gx * gx, weight * gx * gy, weight * gy * gy);
                a11 += gxx;
                a12 += gxy;
                a22 += gyy;
                b1 += gxx * p.0 + gxy * p.1;
                b2 += gxy * p.0 + gyy * p.1;
            }
            let det = a11 * a22 - a12 * a12;
            let trace = a11 + a22;
            if trace <= 0.0 || det.abs() < 1e-9 * trace * trace {
                return None;
            }
            let next = Coord((a22 * b1 - a12 * b2) / det, (a11 * b2 - a12 * b1) / det);
            let shift = next.dist(&q);
            q = next;
            if !(q.0.is_finite() && q.1.is_finite()) || q.dist(&self.center) > max_shift {
                return None;
            }
            if shift < eps {
                break;
            }
        }
        Some(q)
    }
}

#[cfg(test)]
mod tests {
    use super::{Precision, RegionRefiner};
    use crate::config::RefinerParams;
    use crate::geometry::{Coord, Global, Quad, Region};
    use crate::synthetic::{render_scene, MarkerSpec};
    use image::{GrayImage, Luma};

    fn scene(spec: MarkerSpec) -> GrayImage {
        image::imageops::grayscale(&render_scene(320, 320, &[spec]))
    }

    #[test]
    fn test_refine_corners_to_pixel_boundaries() {
        let params = RefinerParams::default();
        let refiner = RegionRefiner::new(&params);
        let gray = scene(MarkerSpec::new(160.0, 160.0, 160.0, 0.0));
        // boundary between pixel 79 and 80 sits at index coordinate 79.5
        let coarse: Quad<Global> = Quad::from_unordered([
            Coord(73.0, 74.0),
            Coord(246.0, 75.0),
            Coord(245.0, 246.0),
            Coord(74.0, 244.0),
        ]);
        let refined = refiner.refine_corners(&gray, &coarse);
        assert_eq!(refined.precision, Precision::Refined);
        let expected = [(79.5, 79.5), (239.5, 79.5), (239.5, 239.5), (79.5, 239.5)];
        for (c, e) in refined.quad.corners().iter().zip(expected) {
            assert!((c.0 - e.0).abs() < 0.75 && (c.1 - e.1).abs() < 0.75, "{c:?} vs {e:?}");
        }
        assert!((refined.quad.mean_side() - 160.0).abs() < 1.5);
    }

    #[test]
    fn test_refine_corners_falls_back_on_flat_image() {
        let params = RefinerParams::default();
        let refiner = RegionRefiner::new(&params);
        let gray = GrayImage::from_pixel(100, 100, Luma([128]));
        let coarse: Quad<Global> = Quad::from_unordered([
            Coord(20.0, 20.0),
            Coord(80.0, 20.0),
            Coord(80.0, 80.0),
            Coord(20.0, 80.0),
        ]);
        let refined = refiner.refine_corners(&gray, &coarse);
        assert_eq!(refined.precision, Precision::Fallback);
        assert_eq!(refined.quad, coarse);
    }

    #[test]
    fn test_refine_quad_gate() {
        let params = RefinerParams::default();
        let refiner = RegionRefiner::new(&params);
        let gray = scene(MarkerSpec::new(160.0, 160.0, 160.0, 0.0));
        let refined = refiner
            .refine_quad(&gray, &Region::new(78, 78, 164, 164))
            .expect("marker passes the gate");
        let side = refined.quad.mean_side();
        assert!((side - 160.0).abs() < 6.0, "side {side}");

        let flat = GrayImage::from_fn(200, 200, |x, _| Luma([if x < 100 { 30 } else { 220 }]));
        assert!(refiner.refine_quad(&flat, &Region::new(0, 0, 200, 40)).is_none());
    }

    #[test]
    fn test_coarse_quad_with_frame_on_crop_edge() {
        // box equal to the marker extent, so the dark frame fills the crop's outer rows and columns
        let params = RefinerParams::default();
        let refiner = RegionRefiner::new(&params);
        let gray = scene(MarkerSpec::new(160.0, 160.0, 160.0, 0.0));
        let coarse = refiner
            .coarse_quad(&gray, &Region::new(80, 80, 160, 160))
            .expect("upright marker passes the gate");
        assert!((coarse.mean_side() - 160.0).abs() < 4.0, "side {}", coarse.mean_side());
        let c = coarse.corners();
        assert!((c[0].0 - 80.0).abs() < 2.0 && (c[0].1 - 80.0).abs() < 2.0);
        assert!((c[2].0 - 239.0).abs() < 2.0 && (c[2].1 - 239.0).abs() < 2.0);
    }
}
