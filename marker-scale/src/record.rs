//! Calibration output record and its JSON form:
//!
//! ```json
//! {"image": null, "image_size": {"width": 640, "height": 480},
//!  "markers": [{"id": 1, "mm_per_px": 0.3, "edge_mm": 47.5,
//!               "corners": [{"x": 10, "y": 12}, ...]}]}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::{Coord, Global, Quad};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelCorner {
    pub x: i32,
    pub y: i32,
}

impl From<&Coord> for PixelCorner {
    fn from(c: &Coord) -> Self {
        PixelCorner {
            x: c.0.round() as i32,
            y: c.1.round() as i32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMarker {
    pub id: u32,
    pub mm_per_px: f64,
    pub edge_mm: f64,
    /// Top-left, top-right, bottom-right, bottom-left in full-image pixels.
    pub corners: [PixelCorner; 4],
}

impl CalibrationMarker {
    pub fn new(id: u32, edge_mm: f64, px_edge: f64, quad: &Quad<Global>) -> CalibrationMarker {
        CalibrationMarker {
            id,
            mm_per_px: edge_mm / px_edge,
            edge_mm,
            corners: quad.corners().each_ref().map(PixelCorner::from),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub image: Option<String>,
    pub image_size: ImageSize,
    pub markers: Vec<CalibrationMarker>,
}

impl CalibrationRecord {
    pub fn new(width: u32, height: u32, markers: Vec<CalibrationMarker>) -> CalibrationRecord {
        CalibrationRecord {
            image: None,
            image_size: ImageSize { width, height },
            markers,
        }
    }

    /// Copy with the source image name filled in.
    pub fn with_image_name(&self, name: impl Into<String>) -> CalibrationRecord {
        CalibrationRecord {
            image: Some(name.into()),
            ..self.clone()
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(raw: &str) -> Result<CalibrationRecord> {
        Ok(serde_json::from_str(raw)?)
    }
}
