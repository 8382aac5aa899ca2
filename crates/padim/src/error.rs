//! Library error type.

use std::path::PathBuf;

/// Errors produced by model estimation, scoring and IO.
#[derive(Debug)]
pub enum PadimError {
    /// Invalid configuration value.
    Config(String),
    /// An image or mask could not be read or decoded.
    Image {
        /// Offending file.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Tensor or embedding dimensions disagree.
    ShapeMismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected shape.
        expected: Vec<usize>,
        /// Observed shape.
        got: Vec<usize>,
    },
    /// Too few samples to estimate a covariance.
    NotEnoughSamples {
        /// Required minimum.
        needed: usize,
        /// Samples seen.
        got: usize,
    },
    /// Regularized covariance at a grid location could not be inverted.
    SingularCovariance {
        /// Flat location index (`y * width + x`).
        location: usize,
    },
    /// The feature extractor failed or cannot handle the request.
    Backbone(String),
    /// Model or feature file has an unexpected layout.
    Format(String),
    /// Underlying IO failure.
    Io(std::io::Error),
}

impl std::fmt::Display for PadimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid config: {}", msg),
            Self::Image { path, message } => {
                write!(f, "failed to load image {}: {}", path.display(), message)
            }
            Self::ShapeMismatch {
                what,
                expected,
                got,
            } => write!(
                f,
                "{} shape mismatch: expected {:?}, got {:?}",
                what, expected, got
            ),
            Self::NotEnoughSamples { needed, got } => {
                write!(f, "not enough samples: need {}, got {}", needed, got)
            }
            Self::SingularCovariance { location } => {
                write!(f, "covariance at location {} is singular", location)
            }
            Self::Backbone(msg) => write!(f, "feature extraction failed: {}", msg),
            Self::Format(msg) => write!(f, "bad file format: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for PadimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PadimError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<safetensors::SafeTensorError> for PadimError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::Format(e.to_string())
    }
}

impl From<serde_json::Error> for PadimError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type PadimResult<T> = Result<T, PadimError>;
