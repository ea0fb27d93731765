#![allow(missing_docs)]

pub mod image_transformation;
pub mod overlay;
