//! Engine configuration. Every tunable threshold and weight lives here and is passed to
//! [`crate::calibration::Calibrator`] at construction; nothing is read from the environment.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};
use crate::normalize::IntensityNormalizer;

/// How the dark-region mask threshold is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPolicy {
    Fixed(u8),
    /// Bimodal histogram split.
    Otsu,
}

/// Weights of the candidate score terms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub darkness: f64,
    pub geometry: f64,
    pub size: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            darkness: 0.35,
            geometry: 0.55,
            size: 0.10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub min_area: f64,
    pub min_area_frac: f64,
    pub max_area_ratio: f64,
    pub max_aspect: f64,
    pub approx_eps: f64,
    pub clahe_clip: f32,
    pub clahe_grid: u32,
    pub blur_sigma: f32,
    pub scales: Vec<f64>,
    pub adaptive_block: u32,
    pub adaptive_c: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub auto_canny_sigma: f32,
    pub close_radius: u8,
    pub open_radius: u8,
    pub weights: ScoreWeights,
    /// Relative area at which the size term saturates to 1.
    pub size_saturation: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            min_area: 400.0,
            min_area_frac: 0.00015,
            max_area_ratio: 0.6,
            max_aspect: 1.5,
            approx_eps: 0.02,
            clahe_clip: 2.0,
            clahe_grid: 8,
            blur_sigma: 1.1,
            scales: vec![1.0, 0.8, 0.6],
            adaptive_block: 21,
            adaptive_c: 5.0,
            canny_low: 50.0,
            canny_high: 150.0,
            auto_canny_sigma: 0.33,
            close_radius: 4,
            open_radius: 2,
            weights: ScoreWeights::default(),
            size_saturation: 0.1,
        }
    }
}

impl DetectorParams {
    pub fn normalizer(&self) -> IntensityNormalizer {
        IntensityNormalizer::new(self.blur_sigma, self.clahe_clip, self.clahe_grid)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternParams {
    pub check_border: bool,
    /// Ring width as a fraction of the candidate size.
    pub border_ratio: f64,
    pub border_min_brightness: f64,
    pub border_min_contrast: f64,
    pub check_pattern: bool,
    pub pattern_clahe_clip: f32,
    pub pattern_min_block: u32,
    pub pattern_c: f32,
    pub blob_min_frac: f64,
    pub blob_max_frac: f64,
    pub blob_max_aspect: f64,
    pub min_squares: usize,
    pub grid_bonus: bool,
    /// Largest accepted ratio between the longest and shortest nearest-neighbour spacing.
    pub grid_tolerance: f64,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self {
            check_border: true,
            border_ratio: 0.15,
            border_min_brightness: 140.0,
            border_min_contrast: 60.0,
            check_pattern: true,
            pattern_clahe_clip: 3.5,
            pattern_min_block: 11,
            pattern_c: -5.0,
            blob_min_frac: 0.005,
            blob_max_frac: 0.20,
            blob_max_aspect: 2.0,
            min_squares: 4,
            grid_bonus: true,
            grid_tolerance: 1.6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerParams {
    pub min_fill: f64,
    pub max_aspect: f64,
    pub canny_low: f32,
    pub canny_high: f32,
    pub corner_search_radius: u32,
    pub subpix_window: u32,
    pub subpix_max_iter: usize,
    pub subpix_eps: f64,
    /// Minimum corner response relative to the strongest of the four corners.
    pub min_corner_quality: f32,
}

impl Default for RefinerParams {
    fn default() -> Self {
        Self {
            min_fill: 0.30,
            max_aspect: 1.4,
            canny_low: 30.0,
            canny_high: 120.0,
            corner_search_radius: 16,
            subpix_window: 5,
            subpix_max_iter: 30,
            subpix_eps: 0.01,
            min_corner_quality: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadFinderParams {
    pub max_contours: usize,
    pub min_area: f64,
    /// Edge-preserving smoothing applied before equalization.
    pub bilateral_window: u32,
    pub bilateral_sigma_color: f32,
    pub bilateral_sigma_spatial: f32,
    pub canny_sigmas: Vec<f32>,
    pub gradient_threshold: u8,
    pub clahe_clip: f32,
    pub global_eq_weight: f32,
    pub close_radius: u8,
    pub dilate_radius: u8,
    pub sparse_edge_frac: f64,
    pub centrality_weight: f64,
    pub hough_vote_threshold: u32,
    pub hough_suppression_radius: u32,
    pub segment_min_length: f64,
    pub segment_max_gap: u32,
    pub kmeans_iterations: usize,
    pub kmeans_seed: u64,
    pub warp: bool,
    pub warp_size: u32,
}

impl Default for QuadFinderParams {
    fn default() -> Self {
        Self {
            max_contours: 10,
            min_area: 1500.0,
            bilateral_window: 9,
            bilateral_sigma_color: 75.0,
            bilateral_sigma_spatial: 75.0,
            canny_sigmas: vec![0.15, 0.25, 0.33, 0.45],
            gradient_threshold: 20,
            clahe_clip: 3.0,
            global_eq_weight: 0.3,
            close_radius: 4,
            dilate_radius: 2,
            sparse_edge_frac: 0.01,
            centrality_weight: 0.3,
            hough_vote_threshold: 40,
            hough_suppression_radius: 8,
            segment_min_length: 20.0,
            segment_max_gap: 10,
            kmeans_iterations: 20,
            kmeans_seed: 0,
            warp: true,
            warp_size: 512,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub detector: DetectorParams,
    pub pattern: PatternParams,
    pub refiner: RefinerParams,
    pub finder: QuadFinderParams,
    pub thresholds: Vec<ThresholdPolicy>,
    pub iou_threshold: f64,
    pub max_results: usize,
    pub padding_px: u32,
    pub downscale: f64,
    pub refine_corners: bool,
    pub min_edge_px: f64,
    pub default_edge_mm: f64,
    pub line_thickness: u32,
    pub debug: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            detector: DetectorParams::default(),
            pattern: PatternParams::default(),
            refiner: RefinerParams::default(),
            finder: QuadFinderParams::default(),
            thresholds: vec![
                ThresholdPolicy::Fixed(60),
                ThresholdPolicy::Fixed(80),
                ThresholdPolicy::Fixed(100),
            ],
            iou_threshold: 0.6,
            max_results: 25,
            padding_px: 50,
            downscale: 0.8,
            refine_corners: true,
            min_edge_px: 1.0,
            default_edge_mm: 47.5,
            line_thickness: 6,
            debug: false,
        }
    }
}

impl CalibrationConfig {
    pub fn from_json_str(raw: &str) -> Result<CalibrationConfig> {
        let config: CalibrationConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<CalibrationConfig> {
        let raw = fs::read_to_string(path)?;
        CalibrationConfig::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CalibrationError::InvalidConfig(msg.to_string()));
        if self.thresholds.is_empty() {
            return invalid("threshold set is empty");
        }
        if self.detector.scales.is_empty() {
            return invalid("scale set is empty");
        }
        if self
            .detector
            .scales
            .iter()
            .any(|s| !s.is_finite() || *s <= 0.0)
        {
            return invalid("scales must be positive");
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return invalid("iou_threshold must lie in (0, 1]");
        }
        if !(self.downscale > 0.0 && self.downscale <= 1.0) {
            return invalid("downscale must lie in (0, 1]");
        }
        if self.finder.warp && self.finder.warp_size < 2 {
            return invalid("warp_size must be at least 2");
        }
        if self.finder.bilateral_window == 0 {
            return invalid("bilateral_window must be positive");
        }
        if self.finder.canny_sigmas.is_empty() {
            return invalid("finder needs at least one canny sigma");
        }
        if self.max_results == 0 {
            return invalid("max_results must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CalibrationConfig, ThresholdPolicy};

    #[test]
    fn test_default_is_valid() {
        let config = CalibrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thresholds.len(), 3);
        assert_eq!(config.detector.scales, vec![1.0, 0.8, 0.6]);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"{
            "iou_threshold": 0.5,
            "thresholds": ["otsu", {"fixed": 90}],
            "detector": {"min_area": 900.0}
        }"#;
        let config = CalibrationConfig::from_json_str(raw).unwrap();
        assert_eq!(config.iou_threshold, 0.5);
        assert_eq!(
            config.thresholds,
            vec![ThresholdPolicy::Otsu, ThresholdPolicy::Fixed(90)]
        );
        assert_eq!(config.detector.min_area, 900.0);
        assert_eq!(config.detector.max_aspect, 1.5);
        assert_eq!(config.padding_px, 50);
    }

    #[test]
    fn test_invalid_config() {
        let err = CalibrationConfig::from_json_str(r#"{"thresholds": []}"#).unwrap_err();
        assert!(matches!(err, crate::error::CalibrationError::InvalidConfig(_)));
        let err = CalibrationConfig::from_json_str(r#"{"iou_threshold": 1.5}"#).unwrap_err();
        assert!(!err.is_invalid_input());
        assert!(CalibrationConfig::from_json_str("{not json").is_err());
        let err = CalibrationConfig::from_json_str(r#"{"finder": {"bilateral_window": 0}}"#).unwrap_err();
        assert!(matches!(err, crate::error::CalibrationError::InvalidConfig(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = CalibrationConfig::default();
        let raw = config.to_json_pretty().unwrap();
        assert_eq!(CalibrationConfig::from_json_str(&raw).unwrap(), config);
    }
}
