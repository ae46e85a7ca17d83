use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the sprite cutout pipeline.
///
/// # Why structured errors
///
/// Each variant captures context specific to its error domain (filesystem, image processing,
/// oracle operations, etc.), so the batch driver can decide whether a failure skips one
/// image or aborts the whole run without parsing error strings.
#[derive(Error, Debug)]
pub enum SpriteCutoutError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    /// The seed prompt pass produced no masks, so there is nothing to score.
    #[error("No candidate masks from the seed prompts (file: {path})")]
    NoCandidates { path: String },

    /// Graph-cut refinement could not run (e.g. no foreground or background samples).
    #[error("Graph-cut solver error: {reason}")]
    Solver { reason: String },
}

impl SpriteCutoutError {
    /// Per-image failures that skip the image instead of aborting the run.
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration { .. } | Self::Validation { .. }
        )
    }

    pub(crate) fn model(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                reason.into(),
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpriteCutoutError>;

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct `SpriteCutoutError::FileSystem`
/// directly with the specific path and operation.
impl From<std::io::Error> for SpriteCutoutError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for SpriteCutoutError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for SpriteCutoutError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors only occur while unpacking oracle tensors, so they're
/// categorized as model errors rather than a separate tensor error type.
impl From<ndarray::ShapeError> for SpriteCutoutError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let skip = SpriteCutoutError::NoCandidates {
            path: "a.png".to_string(),
        };
        assert!(skip.is_recoverable());

        let fatal = SpriteCutoutError::Validation {
            field: "min_area".to_string(),
            reason: "must not exceed max_area".to_string(),
        };
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: SpriteCutoutError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SpriteCutoutError::FileSystem { .. }));
        assert!(err.to_string().contains("unknown"));
    }
}
