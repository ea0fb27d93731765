//! End-to-end calibration: candidate search, screening, deduplication, quad extraction,
//! sub-pixel refinement and the mm-per-pixel record with its overlay.

use std::time::Instant;

use image::{Rgb, RgbImage};
use image_transform::overlay::{draw_closed_polyline, draw_corner_dots};
use slog::{debug, info, Logger};

use crate::candidate::{Candidate, CandidateDetector, RejectionCounters};
use crate::config::CalibrationConfig;
use crate::dedup::suppress_overlaps;
use crate::error::{CalibrationError, Result};
use crate::geometry::{Coord, Global, Quad, Region};
use crate::normalize::to_gray;
use crate::pattern::{PatternValidator, PatternVerdict};
use crate::quad_finder::QuadFinder;
use crate::record::{CalibrationMarker, CalibrationRecord};
use crate::refine::{Precision, RefinedQuad, RegionRefiner};
use crate::utils::{elapsed_secs, set_log_config, ImageUtil};

const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const DOT_OUTER: (i32, Rgb<u8>) = (10, Rgb([0, 0, 0]));
const DOT_INNER: (i32, Rgb<u8>) = (7, Rgb([255, 255, 0]));

/// One emitted marker with the geometry behind its record entry.
#[derive(Clone, Debug)]
pub struct MarkerDetail {
    pub id: u32,
    pub quad: Quad<Global>,
    pub precision: Precision,
    pub px_edge: f64,
    /// Rectified view of the marker crop, when warping is enabled.
    pub warped: Option<RgbImage>,
}

/// Everything one calibration call produced.
#[derive(Clone, Debug)]
pub struct CalibrationReport {
    pub record: CalibrationRecord,
    pub overlay: RgbImage,
    pub markers: Vec<MarkerDetail>,
    /// Candidates that survived screening and deduplication, best first.
    pub candidates: Vec<Candidate>,
    pub rejections: RejectionCounters,
}

pub struct Calibrator {
    config: CalibrationConfig,
    log: Logger,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Result<Calibrator> {
        config.validate()?;
        Ok(Calibrator {
            config,
            log: set_log_config(),
        })
    }

    pub fn with_logger(mut self, log: Logger) -> Calibrator {
        self.log = log;
        self
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibration record and annotated copy of `image`.
    pub fn calibrate(&self, image: &RgbImage, edge_mm: f64) -> Result<(CalibrationRecord, RgbImage)> {
        let report = self.calibrate_detailed(image, edge_mm)?;
        Ok((report.record, report.overlay))
    }

    /// Decode `bytes` (any enabled `image` format) and calibrate the result.
    pub fn calibrate_bytes(&self, bytes: &[u8], edge_mm: f64) -> Result<(CalibrationRecord, RgbImage)> {
        if bytes.is_empty() {
            return Err(CalibrationError::InvalidInput("empty image data".to_string()));
        }
        let image = image::load_from_memory(bytes)?.to_rgb8();
        self.calibrate(&image, edge_mm)
    }

    pub fn calibrate_detailed(&self, image: &RgbImage, edge_mm: f64) -> Result<CalibrationReport> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(CalibrationError::InvalidInput(format!(
                "image has no pixels ({}x{})",
                width, height
            )));
        }
        if !edge_mm.is_finite() || edge_mm <= 0.0 {
            return Err(CalibrationError::InvalidInput(format!(
                "edge length must be a positive number of millimeters, got {}",
                edge_mm
            )));
        }

        let tick = Instant::now();
        let gray = to_gray(image);
        let mut rejections = RejectionCounters::default();
        let candidates = self.screened_candidates(&gray, &mut rejections);
        let mut candidates = suppress_overlaps(&candidates, self.config.iou_threshold);
        candidates.truncate(self.config.max_results);
        if self.config.debug {
            info!(
                self.log,
                "candidate search took {:.3}s, {} kept, rejections {:?}",
                elapsed_secs(&tick),
                candidates.len(),
                rejections
            );
        }

        let tick = Instant::now();
        let finder = QuadFinder::new(&self.config.finder);
        let refiner = RegionRefiner::new(&self.config.refiner);
        let mut overlay = image.clone();
        let mut markers: Vec<CalibrationMarker> = Vec::new();
        let mut details: Vec<MarkerDetail> = Vec::new();

        for candidate in &candidates {
            let pad = self.config.padding_px as i32;
            let window = candidate.region().expand(pad, pad).clamp_to(width, height);
            let crop = ImageUtil::crop(image, &window);
            if crop.width() == 0 || crop.height() == 0 {
                continue;
            }
            let small = ImageUtil::rescale(&crop, self.config.downscale);
            let finding = finder.find_quad(&small, self.config.finder.max_contours);
            let Some(local) = finding.best else {
                debug!(self.log, "no quad inside candidate {:?}", candidate.region());
                continue;
            };
            let coarse = local.to_global(
                Coord(window.x as f64, window.y as f64),
                self.config.downscale,
            );
            let refined = if self.config.refine_corners {
                refiner.refine_corners(&gray, &coarse)
            } else {
                RefinedQuad {
                    quad: coarse,
                    precision: Precision::Fallback,
                }
            };
            if refined.precision == Precision::Fallback && self.config.refine_corners {
                debug!(self.log, "kept coarse corners for {:?}", candidate.region());
            }

            let quad = refined.quad;
            let px_edge = quad.mean_side();
            if !px_edge.is_finite() || px_edge < self.config.min_edge_px {
                debug!(self.log, "skipped degenerate quad {:?}", quad.corners());
                continue;
            }
            if !quad.is_convex() {
                debug!(self.log, "skipped non-convex quad {:?}", quad.corners());
                continue;
            }
            let bbox = quad.bounding_box();
            if details
                .iter()
                .any(|d| d.quad.bounding_box().iou(&bbox) > self.config.iou_threshold)
            {
                debug!(self.log, "skipped duplicate quad {:?}", quad.corners());
                continue;
            }

            let id = markers.len() as u32 + 1;
            draw_marker(&mut overlay, &quad, self.config.line_thickness);
            markers.push(CalibrationMarker::new(id, edge_mm, px_edge, &quad));
            details.push(MarkerDetail {
                id,
                quad,
                precision: refined.precision,
                px_edge,
                warped: finding.warped,
            });
        }
        if self.config.debug {
            info!(
                self.log,
                "quad extraction took {:.3}s, {} markers",
                elapsed_secs(&tick),
                markers.len()
            );
        }

        Ok(CalibrationReport {
            record: CalibrationRecord::new(width, height, markers),
            overlay,
            markers: details,
            candidates,
            rejections,
        })
    }

    /// Raw detections that pass the pattern check and the refinement gate, in scan order.
    fn screened_candidates(
        &self,
        gray: &image::GrayImage,
        rejections: &mut RejectionCounters,
    ) -> Vec<Candidate> {
        let detector = CandidateDetector::new(&self.config.detector);
        let validator = PatternValidator::new(&self.config.pattern);
        let refiner = RegionRefiner::new(&self.config.refiner);

        let raw = detector.detect(gray, &self.config.thresholds, rejections);
        let mut kept = Vec::with_capacity(raw.len());
        for candidate in raw {
            let region = candidate.region();
            match validator.check(gray, &region) {
                PatternVerdict::NoBorder => {
                    rejections.border += 1;
                    continue;
                }
                PatternVerdict::NoPattern => {
                    rejections.pattern += 1;
                    continue;
                }
                PatternVerdict::Accepted => {}
            }
            if refiner.coarse_quad(gray, &region).is_none() {
                rejections.refinement += 1;
                continue;
            }
            kept.push(candidate);
        }
        kept
    }
}

/// Calibrate with the default configuration.
pub fn calibrate(image: &RgbImage, edge_mm: f64) -> Result<(CalibrationRecord, RgbImage)> {
    Calibrator::new(CalibrationConfig::default())?.calibrate(image, edge_mm)
}

fn draw_marker(canvas: &mut RgbImage, quad: &Quad<Global>, thickness: u32) {
    let pts = quad.to_f32_pairs();
    draw_closed_polyline(canvas, &pts, OUTLINE_COLOR, thickness);
    draw_corner_dots(canvas, &pts, DOT_OUTER, DOT_INNER);
}

/// Bounding box of a record entry's integer corners.
pub fn marker_bounds(marker: &CalibrationMarker) -> Region {
    let pts = marker
        .corners
        .map(|c| Coord(c.x as f64, c.y as f64));
    Region::bounding(&pts)
}

#[cfg(test)]
mod tests {
    use super::{marker_bounds, Calibrator};
    use crate::config::CalibrationConfig;
    use crate::record::CalibrationMarker;
    use crate::refine::Precision;
    use crate::synthetic::{blank_scene, render_scene, MarkerSpec};
    use image::{ImageFormat, RgbImage};
    use slog::{o, Discard, Logger};
    use std::io::Cursor;

    const EDGE_MM: f64 = 47.5;

    fn calibrator() -> Calibrator {
        Calibrator::new(CalibrationConfig::default())
            .unwrap()
            .with_logger(Logger::root(Discard, o!()))
    }

    fn assert_ordering_law(marker: &CalibrationMarker) {
        let sums = marker.corners.map(|c| c.x + c.y);
        assert!(sums.iter().all(|&s| s >= sums[0]), "{:?}", marker.corners);
        assert!(sums.iter().all(|&s| s <= sums[2]), "{:?}", marker.corners);
    }

    fn center_x(marker: &CalibrationMarker) -> f64 {
        marker.corners.iter().map(|c| c.x as f64).sum::<f64>() / 4.0
    }

    #[test]
    fn test_single_marker_scale() {
        let image = render_scene(320, 320, &[MarkerSpec::new(160.0, 160.0, 160.0, 0.0)]);
        let report = calibrator().calibrate_detailed(&image, EDGE_MM).unwrap();
        let record = &report.record;
        assert_eq!(record.markers.len(), 1);
        assert_eq!(record.image_size.width, 320);
        assert!(record.image.is_none());

        let marker = &record.markers[0];
        assert_eq!(marker.id, 1);
        assert_eq!(marker.edge_mm, EDGE_MM);
        let expected = EDGE_MM / 160.0;
        assert!(
            (marker.mm_per_px - expected).abs() / expected < 0.02,
            "mm_per_px {} expected {}",
            marker.mm_per_px,
            expected
        );
        assert_ordering_law(marker);
        assert!((marker.corners[0].x - 80).abs() <= 2);
        assert!((marker.corners[2].y - 240).abs() <= 2);
        assert_eq!(report.markers[0].precision, Precision::Refined);
        assert_eq!(report.markers[0].warped.as_ref().map(|w| w.width()), Some(512));
    }

    #[test]
    fn test_deterministic() {
        let image = render_scene(320, 320, &[MarkerSpec::new(160.0, 160.0, 160.0, 0.0)]);
        let cal = calibrator();
        let (first, overlay_a) = cal.calibrate(&image, EDGE_MM).unwrap();
        let (second, overlay_b) = cal.calibrate(&image, EDGE_MM).unwrap();
        assert_eq!(first, second);
        assert_eq!(overlay_a, overlay_b);
    }

    #[test]
    fn test_rotated_marker() {
        let image = render_scene(360, 360, &[MarkerSpec::new(180.0, 180.0, 160.0, 15.0)]);
        let (record, _) = calibrator().calibrate(&image, EDGE_MM).unwrap();
        assert_eq!(record.markers.len(), 1);
        let marker = &record.markers[0];
        assert_ordering_law(marker);
        let expected = EDGE_MM / 160.0;
        assert!((marker.mm_per_px - expected).abs() / expected < 0.03);
    }

    #[test]
    fn test_two_markers_scaled_independently() {
        let image = render_scene(
            480,
            320,
            &[
                MarkerSpec::new(110.0, 160.0, 120.0, 0.0),
                MarkerSpec::new(350.0, 160.0, 180.0, 0.0),
            ],
        );
        let config = CalibrationConfig::default();
        let (record, _) = calibrator().calibrate(&image, EDGE_MM).unwrap();
        assert_eq!(record.markers.len(), 2);
        assert_eq!(
            record.markers.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let small = record.markers.iter().find(|m| center_x(m) < 240.0).unwrap();
        let large = record.markers.iter().find(|m| center_x(m) >= 240.0).unwrap();
        assert!((small.mm_per_px - EDGE_MM / 120.0).abs() / (EDGE_MM / 120.0) < 0.02);
        assert!((large.mm_per_px - EDGE_MM / 180.0).abs() / (EDGE_MM / 180.0) < 0.02);

        let (a, b) = (marker_bounds(small), marker_bounds(large));
        assert!(a.iou(&b) <= config.iou_threshold);
        record.markers.iter().for_each(assert_ordering_law);
    }

    #[test]
    fn test_blank_scene_has_no_markers() {
        let image = blank_scene(320, 240);
        let report = calibrator().calibrate_detailed(&image, EDGE_MM).unwrap();
        assert!(report.record.markers.is_empty());
        assert!(report.candidates.is_empty());
        assert_eq!(report.overlay, image);
    }

    #[test]
    fn test_overlay_marks_corners() {
        let image = render_scene(320, 320, &[MarkerSpec::new(160.0, 160.0, 160.0, 0.0)]);
        let (record, overlay) = calibrator().calibrate(&image, EDGE_MM).unwrap();
        assert_eq!(overlay.dimensions(), image.dimensions());
        let c = record.markers[0].corners[0];
        assert_eq!(overlay.get_pixel(c.x as u32, c.y as u32).0, [255, 255, 0]);
    }

    #[test]
    fn test_invalid_input() {
        let cal = calibrator();
        let err = cal.calibrate(&RgbImage::new(0, 0), EDGE_MM).unwrap_err();
        assert!(err.is_invalid_input());

        let image = render_scene(64, 64, &[]);
        assert!(cal.calibrate(&image, 0.0).unwrap_err().is_invalid_input());
        assert!(cal.calibrate(&image, f64::NAN).unwrap_err().is_invalid_input());

        assert!(cal.calibrate_bytes(b"definitely not an image", EDGE_MM).unwrap_err().is_invalid_input());
        assert!(cal.calibrate_bytes(&[], EDGE_MM).unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_calibrate_encoded_bytes() {
        let image = render_scene(320, 320, &[MarkerSpec::new(160.0, 160.0, 160.0, 0.0)]);
        let mut encoded = Cursor::new(Vec::new());
        image.write_to(&mut encoded, ImageFormat::Png).unwrap();
        let (record, _) = calibrator()
            .calibrate_bytes(encoded.get_ref(), EDGE_MM)
            .unwrap();
        assert_eq!(record.markers.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CalibrationConfig {
            thresholds: Vec::new(),
            ..CalibrationConfig::default()
        };
        assert!(Calibrator::new(config).is_err());
    }
}
