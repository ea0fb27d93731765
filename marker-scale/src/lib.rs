#![allow(missing_docs)]

pub mod calibration;
pub mod candidate;
pub mod config;
pub mod dedup;
pub mod error;
pub mod filters;
pub mod geometry;
pub mod masks;
pub mod normalize;
pub mod pattern;
pub mod quad_finder;
pub mod record;
pub mod refine;
#[cfg(test)]
pub(crate) mod synthetic;
pub mod utils;

pub use calibration::{calibrate, CalibrationReport, Calibrator};
pub use config::CalibrationConfig;
pub use error::{CalibrationError, Result};
pub use record::{CalibrationMarker, CalibrationRecord};
