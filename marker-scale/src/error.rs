use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalibrationError {
    /// Empty, malformed or undecodable input.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            CalibrationError::InvalidInput(_) | CalibrationError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
