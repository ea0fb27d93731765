//! Dominant quadrilateral extraction from a crop around a candidate.
//!
//! Contours of a fused edge mask are fitted with four-point polygons (or minimum-area
//! rectangles) and ranked by area, fill, corner regularity, elongation and distance to
//! the crop center. When no contour yields a quad, endpoints of Hough line segments are
//! clustered into four corners instead.

use image::{GrayImage, Luma, RgbImage};
use image_transform::image_transformation::warp_quad_to_square;
use imageproc::filter::bilateral_filter;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::QuadFinderParams;
use crate::filters::morphological_gradient;
use crate::geometry::{
    approximate_polygon, arc_length, convex_hull, is_convex, min_area_rect, polygon_area, Coord,
    Local, Quad, Region,
};
use crate::masks::{
    auto_canny, close_square, count_nonzero, dilate_square, external_contours, otsu_threshold,
    threshold, union, Polarity,
};
use crate::normalize::{equalize_blend, to_gray};

const POLY_EPS: f64 = 0.02;
const CLAHE_GRID: u32 = 8;

/// Best quad of a crop and its optional rectified view.
#[derive(Clone, Debug, Default)]
pub struct QuadFinding {
    pub best: Option<Quad<Local>>,
    pub warped: Option<RgbImage>,
    pub score: f64,
    /// Contours inspected.
    pub contours: usize,
}

pub struct QuadFinder<'a> {
    params: &'a QuadFinderParams,
}

impl<'a> QuadFinder<'a> {
    pub fn new(params: &'a QuadFinderParams) -> QuadFinder<'a> {
        QuadFinder { params }
    }

    pub fn find_quad(&self, crop: &RgbImage, max_contours: usize) -> QuadFinding {
        let (w, h) = crop.dimensions();
        if w < 3 || h < 3 {
            return QuadFinding::default();
        }
        let gray = to_gray(crop);
        let smoothed = bilateral_filter(
            &gray,
            self.params.bilateral_window,
            self.params.bilateral_sigma_color,
            self.params.bilateral_sigma_spatial,
        );
        let eq = equalize_blend(&smoothed, self.params.clahe_clip, CLAHE_GRID, self.params.global_eq_weight);
        let (thin, mask) = self.edge_masks(&eq);

        let mut contours = external_contours(&mask);
        contours.sort_by(|a, b| polygon_area(b).total_cmp(&polygon_area(a)));
        contours.truncate(max_contours);

        let center = Coord(w as f64 / 2.0, h as f64 / 2.0);
        let mut best: Option<(f64, Quad<Local>)> = None;
        for contour in &contours {
            if polygon_area(contour) < self.params.min_area {
                continue;
            }
            let Some(quad) = fit_quad(contour) else {
                continue;
            };
            let score = self.score(&quad, &center);
            if score > best.as_ref().map_or(0.0, |b| b.0) {
                best = Some((score, quad));
            }
        }

        let (score, quad) = match best {
            Some((score, quad)) => (score, Some(quad)),
            None => (0.0, self.quad_from_lines(&thin)),
        };
        let warped = match (&quad, self.params.warp) {
            (Some(q), true) => warp_quad_to_square(crop, &q.to_f32_arrays(), self.params.warp_size),
            _ => None,
        };
        QuadFinding {
            best: quad,
            warped,
            score,
            contours: contours.len(),
        }
    }

    /// Thin edges (fused Canny passes) and the closed, dilated mask used for contours.
    fn edge_masks(&self, eq: &GrayImage) -> (GrayImage, GrayImage) {
        let (w, h) = eq.dimensions();
        let thin = self
            .params
            .canny_sigmas
            .iter()
            .fold(GrayImage::new(w, h), |acc, &sigma| union(&acc, &auto_canny(eq, sigma)));
        let gradient = threshold(&morphological_gradient(eq, 1), self.params.gradient_threshold, Polarity::Bright);
        let fused = close_square(&union(&thin, &gradient), self.params.close_radius);
        let mut mask = dilate_square(&fused, self.params.dilate_radius);

        if (count_nonzero(&mask) as f64) < self.params.sparse_edge_frac * (w * h) as f64 {
            let (dark, _) = otsu_threshold(eq, Polarity::Dark);
            mask = union(&mask, &close_square(&dark, self.params.close_radius));
        }
        (thin, mask)
    }

    /// `area * fill * regularity / (1 + (aspect - 1))`, scaled down with distance from the
    /// crop center by up to `centrality_weight`.
    fn score(&self, quad: &Quad<Local>, center: &Coord) -> f64 {
        let area = quad.area();
        if area <= 0.0 {
            return 0.0;
        }
        let bounds = Region::bounding(quad.corners());
        let box_area = (bounds.w.max(1) * bounds.h.max(1)) as f64;
        let fill = area / box_area;
        let aspect = bounds.w.max(bounds.h) as f64 / bounds.w.min(bounds.h).max(1) as f64;
        let base = area * fill * corner_regularity(quad) / (1.0 + (aspect - 1.0).max(0.0));

        let max_dist = center.0.hypot(center.1);
        let dist = quad.centroid().dist(center);
        let centrality = 1.0 - (dist / max_dist) * self.params.centrality_weight;
        base * centrality
    }

    /// Cluster endpoints of Hough line segments into four corners.
    pub fn quad_from_lines(&self, edges: &GrayImage) -> Option<Quad<Local>> {
        let options = LineDetectionOptions {
            vote_threshold: self.params.hough_vote_threshold,
            suppression_radius: self.params.hough_suppression_radius,
        };
        let endpoints = detect_lines(edges, options)
            .iter()
            .filter_map(|line| {
                longest_segment(edges, line, self.params.segment_max_gap, self.params.segment_min_length)
            })
            .flat_map(|(a, b)| [a, b])
            .collect_vec();
        if endpoints.len() < 4 {
            return None;
        }
        let centers = kmeans(
            &endpoints,
            4,
            self.params.kmeans_iterations,
            self.params.kmeans_seed,
        )?;
        let quad: Quad<Local> = Quad::from_unordered(centers);
        (quad.is_convex() && quad.area() > 0.0).then_some(quad)
    }
}

/// Four-point approximation of the contour hull, or its minimum-area rectangle.
fn fit_quad(contour: &[Coord]) -> Option<Quad<Local>> {
    let hull = convex_hull(contour);
    if hull.len() < 3 {
        return None;
    }
    let approx = approximate_polygon(&hull, POLY_EPS * arc_length(&hull));
    let pts: [Coord; 4] = if approx.len() == 4 && is_convex(&approx) {
        [approx[0], approx[1], approx[2], approx[3]]
    } else {
        min_area_rect(&hull)?.0
    };
    Some(Quad::from_unordered(pts))
}

/// 1 for right angles, falling towards 0 as corners flatten or sharpen.
fn corner_regularity(quad: &Quad<Local>) -> f64 {
    let c = quad.corners();
    let deviation: f64 = (0..4)
        .map(|i| {
            let prev = c[(i + 3) % 4].sub(&c[i]);
            let next = c[(i + 1) % 4].sub(&c[i]);
            let norm = prev.0.hypot(prev.1) * next.0.hypot(next.1);
            if norm > 0.0 {
                (prev.dot(&next) / norm).abs()
            } else {
                1.0
            }
        })
        .sum();
    (1.0 - deviation / 4.0).max(0.0)
}

fn is_edge(edges: &GrayImage, x: i64, y: i64) -> bool {
    let (w, h) = (edges.width() as i64, edges.height() as i64);
    (-1..=1).cartesian_product(-1..=1).any(|(dx, dy)| {
        let (nx, ny) = (x + dx, y + dy);
        nx >= 0 && ny >= 0 && nx < w && ny < h && edges.get_pixel(nx as u32, ny as u32)[0] != 0
    })
}

/// Longest run of edge support along `line`, bridging gaps up to `max_gap` samples.
fn longest_segment(edges: &GrayImage, line: &PolarLine, max_gap: u32, min_length: f64) -> Option<(Coord, Coord)> {
    let theta = (line.angle_in_degrees as f64).to_radians();
    let normal = Coord(theta.cos(), theta.sin());
    let dir = Coord(-theta.sin(), theta.cos());
    let foot = normal.scale(line.r as f64);
    let reach = (edges.width() as f64).hypot(edges.height() as f64);

    let mut best: Option<(f64, f64)> = None;
    let mut run: Option<(f64, f64)> = None;
    let mut gap = 0u32;
    let mut t = -reach;
    while t <= reach {
        let p = foot.sum(&dir.scale(t));
        if is_edge(edges, p.0.round() as i64, p.1.round() as i64) {
            run = Some(run.map_or((t, t), |(start, _)| (start, t)));
            gap = 0;
        } else if let Some((start, end)) = run {
            gap += 1;
            if gap > max_gap {
                if best.map_or(true, |b| end - start > b.1 - b.0) {
                    best = Some((start, end));
                }
                run = None;
            }
        }
        t += 1.0;
    }
    if let Some((start, end)) = run {
        if best.map_or(true, |b| end - start > b.1 - b.0) {
            best = Some((start, end));
        }
    }
    let (start, end) = best?;
    (end - start >= min_length).then(|| (foot.sum(&dir.scale(start)), foot.sum(&dir.scale(end))))
}

/// k-means over 2D points with k-means++ seeding from a fixed seed; nearest-center
/// assignment goes through a kd-tree of the current centers.
fn kmeans(points: &[Coord], k: usize, iterations: usize, seed: u64) -> Option<[Coord; 4]> {
    if k != 4 || points.len() < k {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centers = vec![points[rng.gen_range(0..points.len())]];
    while centers.len() < k {
        let weights = points
            .iter()
            .map(|p| centers.iter().map(|c| p.dist(c).powi(2)).fold(f64::MAX, f64::min))
            .collect_vec();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let mut pick = rng.gen_range(0.0..total);
        let idx = weights
            .iter()
            .position(|w| {
                pick -= w;
                pick < 0.0
            })
            .unwrap_or(points.len() - 1);
        centers.push(points[idx]);
    }

    for _ in 0..iterations {
        let data = centers
            .iter()
            .map(|c| [c.0.round() as i32, c.1.round() as i32])
            .collect_vec();
        let tree = kd_tree::KdIndexTree::build(&data);
        let mut sums = vec![(Coord::default(), 0usize); k];
        for p in points {
            if let Some(found) = tree.nearest(&[p.0.round() as i32, p.1.round() as i32]) {
                let slot = &mut sums[*found.item];
                slot.0 = slot.0.sum(p);
                slot.1 += 1;
            }
        }
        let next = sums
            .iter()
            .zip(&centers)
            .map(|((sum, n), old)| if *n > 0 { sum.scale(1.0 / *n as f64) } else { *old })
            .collect_vec();
        let moved = next.iter().zip(&centers).map(|(a, b)| a.dist(b)).fold(0.0, f64::max);
        centers = next;
        if moved < 1e-3 {
            break;
        }
    }
    Some([centers[0], centers[1], centers[2], centers[3]])
}

/// Paint a one-pixel outline for tests and debug views.
pub fn outline(width: u32, height: u32, corners: &[Coord; 4]) -> GrayImage {
    let mut img = GrayImage::new(width, height);
    for (a, b) in corners.iter().circular_tuple_windows() {
        let steps = a.dist(b).ceil().max(1.0) as usize;
        for i in 0..=steps {
            let p = a.sum(&b.sub(a).scale(i as f64 / steps as f64));
            let (x, y) = (p.0.round(), p.1.round());
            if x >= 0.0 && y >= 0.0 && (x as u32) < width && (y as u32) < height {
                img.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    img
}
