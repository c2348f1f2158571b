use crate::camera::CameraModelError;

/// Errors raised by the reconstruction stages.
///
/// Most data problems never surface as errors: insufficient data yields empty
/// results and degenerate geometry falls back to synthetic placement. What is
/// left here is precondition failure and I/O.
#[derive(thiserror::Error, Debug)]
pub enum SfmError {
    #[error("No input images were provided")]
    NoImages,
    #[error("Stage {0} produced no output")]
    EmptyStage(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Failed to process YAML: {0}")]
    YamlError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("Image error: {0}")]
    ImageError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error(transparent)]
    CameraModel(#[from] CameraModelError),
}

impl From<std::io::Error> for SfmError {
    fn from(err: std::io::Error) -> Self {
        SfmError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SfmError {
    fn from(err: serde_yaml::Error) -> Self {
        SfmError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for SfmError {
    fn from(err: serde_json::Error) -> Self {
        SfmError::JsonError(err.to_string())
    }
}

impl From<image::ImageError> for SfmError {
    fn from(err: image::ImageError) -> Self {
        SfmError::ImageError(err.to_string())
    }
}

impl From<csv::Error> for SfmError {
    fn from(err: csv::Error) -> Self {
        SfmError::CsvError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SfmError>;
