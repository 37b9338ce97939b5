//! Error types for vecgate operations.

use thiserror::Error;

use crate::handle::IndexKind;

/// Result type alias using vecgate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with native handles.
///
/// Every variant except [`Error::NativeFailure`] is detected in managed code
/// before the engine boundary is crossed.
#[derive(Debug, Error)]
pub enum Error {
    /// Non-positive dimension, or two dimensions that must agree and do not.
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    /// Buffer length is not a multiple of the vector dimension.
    #[error("buffer of length {len} is not a multiple of dimension {dimension}")]
    InvalidVectorLength { len: usize, dimension: usize },

    /// Non-positive neighbor count.
    #[error("invalid k: {0}, must be positive")]
    InvalidK(usize),

    /// The operation requires a trained handle.
    #[error("index is not trained")]
    NotTrained,

    /// The handle's native reference has already been released.
    #[error("handle has been released")]
    ReleasedHandle,

    /// The child is already owned by another composite.
    #[error("ownership conflict: {0}")]
    OwnershipConflict(String),

    /// Opaque non-zero status returned by the native engine.
    #[error("native call {function} failed with status {code}")]
    NativeFailure { code: i32, function: &'static str },

    /// The operation is not meaningful for this kind of handle.
    #[error("{operation} is not supported by {kind:?} handles")]
    UnsupportedOperation {
        operation: &'static str,
        kind: IndexKind,
    },

    /// Not enough training vectors for the requested cluster count.
    #[error("insufficient training data: have {have} vectors, need at least {need}")]
    InsufficientTrainingData { have: usize, need: usize },

    /// A tuning parameter was out of range or unknown.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The pipeline description could not be parsed.
    #[error("invalid index description: {0}")]
    InvalidDescription(String),

    /// The id list does not match the number of vectors.
    #[error("got {ids} ids for {vectors} vectors")]
    InvalidIds { ids: usize, vectors: usize },

    /// Reconstruction key outside the stored range.
    #[error("key {key} out of range for {len} stored vectors")]
    KeyOutOfRange { key: i64, len: usize },

    /// Runtime configuration was rejected.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error while reading or writing index files.
    #[error("io error: {0}")]
    Io(String),

    /// A background task running a blocking call panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Returns the raw native status code, if this error came from the engine.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Error::NativeFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidVectorLength {
            len: 10,
            dimension: 4,
        };
        assert_eq!(
            err.to_string(),
            "buffer of length 10 is not a multiple of dimension 4"
        );

        let err = Error::UnsupportedOperation {
            operation: "nprobe",
            kind: IndexKind::Graph,
        };
        assert_eq!(err.to_string(), "nprobe is not supported by Graph handles");
    }

    #[test]
    fn test_native_code() {
        let err = Error::NativeFailure {
            code: -3,
            function: "faiss_Index_add",
        };
        assert_eq!(err.native_code(), Some(-3));
        assert_eq!(Error::NotTrained.native_code(), None);
    }
}
