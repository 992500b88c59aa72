//! Centralized error types for grurt.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Status returned to callers that speak the integer layer protocol when
/// an allocation fails.
pub const STATUS_OUT_OF_MEMORY: i32 = -100;

/// Status for every other failure.
pub const STATUS_FAILED: i32 = -1;

/// Main error type for grurt operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GruError {
    /// A workspace or output allocation could not be satisfied.
    #[error("Out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// Invalid runtime or layer configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor or weight block has the wrong shape.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Precision / storage combination not available in this build.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// `forward` was called before `create_pipeline`.
    #[error("Pipeline not created")]
    PipelineNotReady,

    /// Raw weights were dropped by light mode and are needed again.
    #[error("Raw weights released by light mode")]
    WeightsReleased,

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, GruError>;

impl GruError {
    /// Integer status for the layer protocol: 0 is reserved for success.
    pub fn status(&self) -> i32 {
        match self {
            GruError::OutOfMemory { .. } => STATUS_OUT_OF_MEMORY,
            _ => STATUS_FAILED,
        }
    }

    /// Check if error came from the allocator rather than the caller.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, GruError::OutOfMemory { .. })
    }

    pub fn shape(expected: &[usize], actual: &[usize]) -> Self {
        GruError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Collapse a call result to the integer status convention.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GruError::OutOfMemory { bytes: 4096 };
        assert!(err.to_string().contains("4096 bytes"));
        assert!(err.is_out_of_memory());
        assert_eq!(err.status(), STATUS_OUT_OF_MEMORY);
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = GruError::shape(&[4, 2], &[4, 3]);
        assert!(err.to_string().contains("[4, 2]"));
        assert_eq!(err.status(), STATUS_FAILED);
    }

    #[test]
    fn test_status_code() {
        let ok: Result<()> = Ok(());
        assert_eq!(status_code(&ok), 0);
        let oom: Result<()> = Err(GruError::OutOfMemory { bytes: 1 });
        assert_eq!(status_code(&oom), -100);
        let other: Result<()> = Err(GruError::PipelineNotReady);
        assert_eq!(status_code(&other), -1);
    }
}
