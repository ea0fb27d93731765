//! Planar geometry used by the detector: points, axis-aligned regions, canonically
//! ordered quadrilaterals and the polygon routines that operate on traced contours.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;

const SUM_TIE_EPS: f64 = 1e-9;

#[derive(PartialEq, PartialOrd, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Coord(pub f64, pub f64);

impl Coord {
    pub fn sum(self, other: &Coord) -> Coord {
        Coord(self.0 + other.0, self.1 + other.1)
    }
    pub fn sub(self, other: &Coord) -> Coord {
        Coord(self.0 - other.0, self.1 - other.1)
    }
    pub fn scale(self, factor: f64) -> Coord {
        Coord(self.0 * factor, self.1 * factor)
    }
    pub fn dist(self, other: &Coord) -> f64 {
        (self.0 - other.0).hypot(self.1 - other.1)
    }
    pub fn cross(self, other: &Coord) -> f64 {
        self.0 * other.1 - self.1 * other.0
    }
    pub fn dot(self, other: &Coord) -> f64 {
        self.0 * other.0 + self.1 * other.1
    }
    pub fn to_f32_pair(self) -> (f32, f32) {
        (self.0 as f32, self.1 as f32)
    }
}

impl From<imageproc::point::Point<i32>> for Coord {
    fn from(p: imageproc::point::Point<i32>) -> Self {
        Coord(p.x as f64, p.y as f64)
    }
}

///Define an axis-aligned rectangle by its top-left corner and size
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Region {
        Region { x, y, w, h }
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Grow by `dx`/`dy` on every side.
    pub fn expand(&self, dx: i32, dy: i32) -> Region {
        Region::new(self.x - dx, self.y - dy, self.w + 2 * dx, self.h + 2 * dy)
    }

    /// Clip to the `[0, width) x [0, height)` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Region {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = self.right().clamp(0, width as i32);
        let y1 = self.bottom().clamp(0, height as i32);
        Region::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn intersection_area(&self, other: &Region) -> i64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 > x1 && y2 > y1 {
            (x2 - x1) as i64 * (y2 - y1) as i64
        } else {
            0
        }
    }

    /// Intersection over union; zero when either region is empty.
    pub fn iou(&self, other: &Region) -> f64 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union > 0 {
            intersection as f64 / union as f64
        } else {
            0.0
        }
    }

    /// Bounding region of a point set, following the inclusive-pixel convention of
    /// contour tracing: a single pixel has size 1x1.
    pub fn bounding(pts: &[Coord]) -> Region {
        if pts.is_empty() {
            return Region::default();
        }
        let (min_x, max_x) = pts
            .iter()
            .map(|p| p.0)
            .minmax()
            .into_option()
            .unwrap_or((0.0, 0.0));
        let (min_y, max_y) = pts
            .iter()
            .map(|p| p.1)
            .minmax_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .into_option()
            .unwrap_or((0.0, 0.0));
        let x = min_x.floor() as i32;
        let y = min_y.floor() as i32;
        Region::new(
            x,
            y,
            max_x.floor() as i32 - x + 1,
            max_y.floor() as i32 - y + 1,
        )
    }
}

/// Coordinate space a [`Quad`] lives in.
pub trait CoordSpace: Copy + Clone + Debug + PartialEq {}

/// Coordinates relative to a (possibly downscaled) crop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Local;

/// Coordinates in the full input image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Global;

impl CoordSpace for Local {}
impl CoordSpace for Global {}

/// Four corners in canonical order: top-left, top-right, bottom-right, bottom-left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad<S: CoordSpace> {
    corners: [Coord; 4],
    space: PhantomData<S>,
}

impl<S: CoordSpace> Quad<S> {
    /// Canonically order four arbitrary points.
    ///
    /// Top-left has the minimum `x + y` and bottom-right the maximum; among tied maxima the
    /// point farthest from top-left wins, so a 45 degree square keeps opposite vertices on
    /// the diagonal. Of the two remaining points, the one on the upper-right side of the
    /// top-left to bottom-right diagonal is top-right.
    pub fn from_unordered(pts: [Coord; 4]) -> Quad<S> {
        let sum = |p: &Coord| p.0 + p.1;
        let tl = (1..4).fold(0, |best, i| if sum(&pts[i]) < sum(&pts[best]) { i } else { best });
        let max_sum = pts.iter().map(sum).fold(f64::MIN, f64::max);
        let tol = SUM_TIE_EPS * (1.0 + max_sum.abs());
        let br = (0..4)
            .filter(|&i| i != tl && sum(&pts[i]) >= max_sum - tol)
            .max_by(|&i, &j| pts[i].dist(&pts[tl]).total_cmp(&pts[j].dist(&pts[tl])))
            .unwrap_or((tl + 2) % 4);

        let diagonal = pts[br].sub(&pts[tl]);
        let side = |i: usize| diagonal.cross(&pts[i].sub(&pts[tl]));
        let rest = (0..4).filter(|&i| i != tl && i != br).collect_vec();
        let (tr, bl) = if side(rest[0]) <= side(rest[1]) {
            (rest[0], rest[1])
        } else {
            (rest[1], rest[0])
        };
        Quad {
            corners: [pts[tl], pts[tr], pts[br], pts[bl]],
            space: PhantomData,
        }
    }

    pub fn corners(&self) -> &[Coord; 4] {
        &self.corners
    }

    pub fn side_lengths(&self) -> [f64; 4] {
        let c = &self.corners;
        [
            c[0].dist(&c[1]),
            c[1].dist(&c[2]),
            c[2].dist(&c[3]),
            c[3].dist(&c[0]),
        ]
    }

    /// Mean of the four side lengths.
    pub fn mean_side(&self) -> f64 {
        self.side_lengths().iter().sum::<f64>() / 4.0
    }

    pub fn area(&self) -> f64 {
        polygon_area(&self.corners)
    }

    pub fn centroid(&self) -> Coord {
        self.corners
            .iter()
            .fold(Coord::default(), |acc, p| acc.sum(p))
            .scale(0.25)
    }

    /// True for a simple, strictly convex quadrilateral with finite corners.
    pub fn is_convex(&self) -> bool {
        self.corners.iter().all(|p| p.0.is_finite() && p.1.is_finite()) && is_convex(&self.corners)
    }

    pub fn bounding_box(&self) -> Region {
        Region::bounding(&self.corners)
    }

    pub fn to_f32_pairs(&self) -> [(f32, f32); 4] {
        self.corners.map(Coord::to_f32_pair)
    }

    pub fn to_f32_arrays(&self) -> [[f32; 2]; 4] {
        self.corners.map(|p| [p.0 as f32, p.1 as f32])
    }

    /// Replace the corners while keeping the space; the result is re-ordered canonically.
    pub fn with_corners(&self, corners: [Coord; 4]) -> Quad<S> {
        Quad::from_unordered(corners)
    }
}

impl Quad<Local> {
    /// Map crop-space corners into the full image: `offset + p / scale`.
    pub fn to_global(&self, offset: Coord, scale: f64) -> Quad<Global> {
        let inv = if scale > 0.0 { 1.0 / scale } else { 1.0 };
        Quad::from_unordered(self.corners.map(|p| offset.sum(&p.scale(inv))))
    }
}

/// Absolute shoelace area of a closed polygon.
pub fn polygon_area(pts: &[Coord]) -> f64 {
    if pts.len() < 3 {
        return 0.0;
    }
    let twice: f64 = pts
        .iter()
        .circular_tuple_windows()
        .map(|(a, b)| a.cross(b))
        .sum();
    twice.abs() / 2.0
}

/// Perimeter of a closed polygon.
pub fn arc_length(pts: &[Coord]) -> f64 {
    if pts.len() < 2 {
        return 0.0;
    }
    pts.iter()
        .circular_tuple_windows()
        .map(|(a, b)| a.dist(b))
        .sum()
}

#[inline]
fn turn(o: &Coord, a: &Coord, b: &Coord) -> f64 {
    a.sub(o).cross(&b.sub(o))
}

/// Convex hull with Andrew's monotone chain; collinear points are dropped.
pub fn convex_hull(points: &[Coord]) -> Vec<Coord> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<Coord> = Vec::with_capacity(pts.len());
    for p in &pts {
        while lower.len() >= 2 && turn(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<Coord> = Vec::with_capacity(pts.len());
    for p in pts.iter().rev() {
        while upper.len() >= 2 && turn(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// A strictly convex polygon turns the same way at every vertex.
pub fn is_convex(pts: &[Coord]) -> bool {
    if pts.len() < 3 {
        return false;
    }
    let turns = pts
        .iter()
        .circular_tuple_windows()
        .map(|(a, b, c)| turn(a, b, c))
        .collect_vec();
    let eps = 1e-9;
    turns.iter().all(|&t| t > eps) || turns.iter().all(|&t| t < -eps)
}

/// Minimum-area enclosing rectangle of a point set (rotating calipers over the hull).
///
/// Returns the four box points and the rectangle side lengths `(long, short)`.
pub fn min_area_rect(points: &[Coord]) -> Option<([Coord; 4], f64, f64)> {
    let hull = convex_hull(points);
    if hull.len() < 3 {
        return None;
    }
    let mut best: Option<(f64, [Coord; 4], f64, f64)> = None;
    for (p1, p2) in hull.iter().circular_tuple_windows() {
        let edge = p2.sub(p1);
        let len = edge.0.hypot(edge.1);
        if len < 1e-12 {
            continue;
        }
        let u = edge.scale(1.0 / len);
        let v = Coord(-u.1, u.0);
        let (mut min_u, mut max_u, mut min_v, mut max_v) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in &hull {
            let d = p.sub(p1);
            let (pu, pv) = (d.dot(&u), d.dot(&v));
            min_u = min_u.min(pu);
            max_u = max_u.max(pu);
            min_v = min_v.min(pv);
            max_v = max_v.max(pv);
        }
        let (w, h) = (max_u - min_u, max_v - min_v);
        let area = w * h;
        if best.as_ref().map_or(true, |b| area < b.0) {
            let at = |a: f64, b: f64| p1.sum(&u.scale(a)).sum(&v.scale(b));
            let pts = [at(min_u, min_v), at(max_u, min_v), at(max_u, max_v), at(min_u, max_v)];
            best = Some((area, pts, w.max(h), w.min(h)));
        }
    }
    best.map(|(_, pts, long, short)| (pts, long, short))
}

/// Douglas-Peucker simplification of a closed curve with tolerance `epsilon`.
pub fn approximate_polygon(curve: &[Coord], epsilon: f64) -> Vec<Coord> {
    if curve.len() <= 3 {
        return curve.to_vec();
    }
    // split the closed curve at its two mutually farthest-apart points
    let first = 0;
    let far = (1..curve.len())
        .max_by(|&a, &b| {
            curve[first]
                .dist(&curve[a])
                .partial_cmp(&curve[first].dist(&curve[b]))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(1);
    let mut out = simplify_open(&curve[first..=far], epsilon);
    let mut tail: Vec<Coord> = curve[far..].to_vec();
    tail.push(curve[first]);
    let tail = simplify_open(&tail, epsilon);
    out.pop();
    out.extend_from_slice(&tail[..tail.len() - 1]);
    out
}

fn simplify_open(curve: &[Coord], epsilon: f64) -> Vec<Coord> {
    if curve.len() < 3 {
        return curve.to_vec();
    }
    let (a, b) = (curve[0], curve[curve.len() - 1]);
    let ab = b.sub(&a);
    let len = ab.0.hypot(ab.1);
    let (index, dmax) = curve[1..curve.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let d = if len < 1e-12 {
                p.dist(&a)
            } else {
                (ab.cross(&p.sub(&a)) / len).abs()
            };
            (i + 1, d)
        })
        .fold((0, 0.0), |acc, x| if x.1 > acc.1 { x } else { acc });
    if dmax > epsilon {
        let mut left = simplify_open(&curve[..=index], epsilon);
        let right = simplify_open(&curve[index..], epsilon);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![a, b]
    }
}
