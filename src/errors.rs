use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while resolving options, loading images, running the
/// classifier or reporting its results.
///
/// None of them are recovered from inside the crate. The binary prints the
/// message and exits non-zero.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No images found in {dir:?}")]
    NoImages { dir: PathBuf },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: failed to load {path:?}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Inference error: {operation} failed: {message}")]
    Inference { operation: String, message: String },

    #[error("Report error: {message}")]
    Report { message: String },
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

impl ClassifyError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps a runtime failure. ort errors are flattened to their message so
    /// the enum stays `Send + Sync` regardless of the runtime's error type.
    pub fn inference(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Inference {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn report(message: impl Into<String>) -> Self {
        Self::Report {
            message: message.into(),
        }
    }
}

impl From<clap::Error> for ClassifyError {
    fn from(err: clap::Error) -> Self {
        Self::configuration(err.to_string().trim_end())
    }
}

/// Fallback for I/O errors without path context. Call sites that know the
/// path build [`ClassifyError::FileSystem`] themselves.
impl From<std::io::Error> for ClassifyError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Shape errors only come out of tensor reshaping around the classifier call.
impl From<ndarray::ShapeError> for ClassifyError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}

impl From<serde_json::Error> for ClassifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::report(format!("JSON serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let err = ClassifyError::NoImages {
            dir: PathBuf::from("images"),
        };
        assert_eq!(err.to_string(), "No images found in \"images\"");

        let err = ClassifyError::inference("session run", "device unavailable");
        assert_eq!(
            err.to_string(),
            "Inference error: session run failed: device unavailable"
        );
    }

    #[test]
    fn test_shape_error_maps_to_inference() {
        let err: ClassifyError = ndarray::Array1::<f32>::zeros(3)
            .into_shape_with_order((2, 2))
            .unwrap_err()
            .into();
        assert!(matches!(err, ClassifyError::Inference { .. }));
    }
}
