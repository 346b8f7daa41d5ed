//! Error types for the talking heads pipeline

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// libtorch error
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    /// Video decoding failed
    #[error("Video error: {0}")]
    Video(String),

    /// Landmark detection failed or found no face
    #[error("Landmark detection failed: {0}")]
    Landmarks(String),

    /// Malformed dataset layout or processed file
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Checkpoint missing or incompatible with the network
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Whether the error only affects a single video during preprocessing
    pub fn is_per_video(&self) -> bool {
        matches!(self, Error::Video(_) | Error::Landmarks(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Dataset("missing frame_000".to_string());
        assert_eq!(err.to_string(), "Dataset error: missing frame_000");
    }

    #[test]
    fn test_per_video_errors() {
        assert!(Error::Video("truncated".into()).is_per_video());
        assert!(Error::Landmarks("no face".into()).is_per_video());
        assert!(!Error::Config("k = 0".into()).is_per_video());
    }
}
