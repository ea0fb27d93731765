//! Multi-scale, multi-threshold search for dark square regions.

use image::GrayImage;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::{DetectorParams, ThresholdPolicy};
use crate::geometry::{
    approximate_polygon, arc_length, convex_hull, is_convex, min_area_rect, polygon_area, Coord,
    Region,
};
use crate::masks::{
    adaptive_threshold, auto_canny, close_square, edges, external_contours, open_square,
    otsu_threshold, threshold, union, Polarity,
};
use crate::normalize::mean_intensity;
use crate::utils::ImageUtil;

/// Axis-aligned candidate box in full-image coordinates with its ranking metadata.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub score: f64,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub mean_intensity: f64,
}

impl Candidate {
    pub fn region(&self) -> Region {
        Region::new(self.x, self.y, self.w, self.h)
    }
}

/// Why raw contours and candidates were dropped during one call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounters {
    pub area: usize,
    pub aspect: usize,
    pub border: usize,
    pub pattern: usize,
    pub refinement: usize,
}

impl RejectionCounters {
    pub fn total(&self) -> usize {
        self.area + self.aspect + self.border + self.pattern + self.refinement
    }
}

pub struct CandidateDetector<'a> {
    params: &'a DetectorParams,
}

impl<'a> CandidateDetector<'a> {
    pub fn new(params: &'a DetectorParams) -> CandidateDetector<'a> {
        CandidateDetector { params }
    }

    /// Scan `gray` at every configured scale and threshold policy. Candidates keep scan
    /// order: scales outer, policies inner, contours in tracing order.
    pub fn detect(
        &self,
        gray: &GrayImage,
        thresholds: &[ThresholdPolicy],
        counters: &mut RejectionCounters,
    ) -> Vec<Candidate> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }
        let normalizer = self.params.normalizer();
        let mut found = Vec::new();

        for &scale in &self.params.scales {
            let scaled = ImageUtil::rescale(gray, scale);
            let enhanced = normalizer.normalize(&scaled);
            let shared = self.shared_mask(&enhanced);
            let scaled_area = (scaled.width() * scaled.height()) as f64;
            let min_area =
                (self.params.min_area * scale * scale).max(self.params.min_area_frac * scaled_area);
            let max_area = self.params.max_area_ratio * scaled_area;

            for policy in thresholds {
                let base = match policy {
                    ThresholdPolicy::Fixed(level) => threshold(&enhanced, *level, Polarity::Dark),
                    ThresholdPolicy::Otsu => otsu_threshold(&enhanced, Polarity::Dark).0,
                };
                let mask = union(&base, &shared);
                let mask = close_square(&mask, self.params.close_radius);
                let mask = open_square(&mask, self.params.open_radius);

                for contour in external_contours(&mask) {
                    let accepted = self.candidate_from_contour(
                        gray,
                        &contour,
                        scale,
                        (min_area, max_area),
                        counters,
                    );
                    if let Some(candidate) = accepted {
                        found.push(candidate);
                    }
                }
            }
        }
        found
    }

    /// Adaptive and edge masks do not depend on the threshold policy.
    fn shared_mask(&self, enhanced: &GrayImage) -> GrayImage {
        let adaptive = adaptive_threshold(
            enhanced,
            self.params.adaptive_block,
            self.params.adaptive_c,
            Polarity::Dark,
        );
        let auto = auto_canny(enhanced, self.params.auto_canny_sigma);
        let fixed = edges(enhanced, self.params.canny_low, self.params.canny_high);
        union(&adaptive, &union(&auto, &fixed))
    }

    fn candidate_from_contour(
        &self,
        gray: &GrayImage,
        contour: &[Coord],
        scale: f64,
        (min_area, max_area): (f64, f64),
        counters: &mut RejectionCounters,
    ) -> Option<Candidate> {
        let area = polygon_area(contour);
        if area < min_area {
            counters.area += 1;
            return None;
        }
        let hull = convex_hull(contour);
        let hull_area = polygon_area(&hull);
        if !(hull_area > min_area && hull_area < max_area) {
            counters.area += 1;
            return None;
        }

        let approx = approximate_polygon(&hull, self.params.approx_eps * arc_length(&hull));
        let quad = if approx.len() == 4 && is_convex(&approx) {
            approx
        } else {
            min_area_rect(&hull)?.0.to_vec()
        };
        let local = Region::bounding(&quad);
        if local.is_empty() {
            return None;
        }

        let region = Region::new(
            (local.x as f64 / scale) as i32,
            (local.y as f64 / scale) as i32,
            (local.w as f64 / scale) as i32,
            (local.h as f64 / scale) as i32,
        );
        if region.is_empty() {
            return None;
        }
        let long = region.w.max(region.h) as f64;
        let short = region.w.min(region.h).max(1) as f64;
        if long / short > self.params.max_aspect {
            counters.aspect += 1;
            return None;
        }

        let roi = ImageUtil::crop(gray, &region);
        if roi.width() == 0 || roi.height() == 0 {
            return None;
        }
        let mean = mean_intensity(&roi);
        let frame_area = (gray.width() * gray.height()) as f64;

        let darkness = (1.0 - mean / 255.0).max(0.0);
        let solidity = if hull_area > 0.0 { area / hull_area } else { 0.0 };
        let extent = area / (local.w as f64 * local.h as f64);
        let geometry = solidity * extent;
        let size_ratio = region.area() as f64 / frame_area;
        let size = (size_ratio / self.params.size_saturation).min(1.0);

        let w = &self.params.weights;
        Some(Candidate {
            score: w.darkness * darkness + w.geometry * geometry + w.size * size,
            x: region.x,
            y: region.y,
            w: region.w,
            h: region.h,
            mean_intensity: mean,
        })
    }
}

/// Highest score first; equal scores keep their scan order.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Boxes of the top `n` candidates, for debug overlays.
pub fn boxes(candidates: &[Candidate], n: usize) -> Vec<(i32, i32, u32, u32)> {
    candidates
        .iter()
        .take(n)
        .map(|c| (c.x, c.y, c.w.max(0) as u32, c.h.max(0) as u32))
        .collect_vec()
}

#[cfg(test)]
mod tests {
    use super::{rank, Candidate, CandidateDetector, RejectionCounters};
    use crate::config::{DetectorParams, ThresholdPolicy};
    use crate::synthetic::{blank_scene, render_scene, MarkerSpec};

    fn detect(image: &image::RgbImage) -> (Vec<Candidate>, RejectionCounters) {
        let params = DetectorParams::default();
        let gray = image::imageops::grayscale(image);
        let mut counters = RejectionCounters::default();
        let found = CandidateDetector::new(&params).detect(
            &gray,
            &[ThresholdPolicy::Fixed(80), ThresholdPolicy::Otsu],
            &mut counters,
        );
        (found, counters)
    }

    #[test]
    fn test_detects_single_marker() {
        let spec = MarkerSpec::new(160.0, 160.0, 160.0, 0.0);
        let (found, _) = detect(&render_scene(320, 320, &[spec]));
        assert!(!found.is_empty());
        let best = found
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap())
            .unwrap();
        assert!((best.x - 80).abs() <= 4, "{best:?}");
        assert!((best.y - 80).abs() <= 4, "{best:?}");
        assert!((best.w - 160).abs() <= 8, "{best:?}");
        assert!(best.mean_intensity < 150.0);
        assert!(best.score > 0.0 && best.score <= 1.0);
    }

    #[test]
    fn test_blank_scene_has_no_candidates() {
        let (found, _) = detect(&blank_scene(240, 200));
        assert!(found.is_empty());
    }

    #[test]
    fn test_rejects_elongated_bar() {
        let img = image::RgbImage::from_fn(320, 200, |x, y| {
            let v = if (40..280).contains(&x) && (80..120).contains(&y) { 20 } else { 240 };
            image::Rgb([v, v, v])
        });
        let (found, counters) = detect(&img);
        assert!(found.is_empty());
        assert!(counters.aspect > 0);
    }

    #[test]
    fn test_rank_is_stable() {
        let mk = |score, x| Candidate {
            score,
            x,
            y: 0,
            w: 10,
            h: 10,
            mean_intensity: 0.0,
        };
        let mut cands = vec![mk(0.5, 1), mk(0.9, 2), mk(0.5, 3)];
        rank(&mut cands);
        assert_eq!(cands.iter().map(|c| c.x).collect::<Vec<_>>(), vec![2, 1, 3]);
    }
}
