//! Error types for the chunked scan engine.
//!
//! Every variant except `Serialization` is raised before any chunk is
//! computed. Numeric anomalies (NaN/Inf produced by extreme gates) are not
//! errors; see `runtime::health`.

use thiserror::Error;

/// Specialised result type for engine operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Validation and persistence failures.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A tensor does not have the shape the call requires.
    #[error("shape mismatch for `{tensor}`: {detail}")]
    Shape {
        /// Which input tensor is malformed.
        tensor: &'static str,
        /// Expected vs. actual dimensions.
        detail: String,
    },

    /// Chunk length must be positive.
    #[error("chunk length must be positive, got {0}")]
    InvalidChunkLength(usize),

    /// Chunk length exceeds the configured maximum.
    #[error("chunk length {requested} exceeds the configured maximum {max}")]
    ChunkTooLarge { requested: usize, max: usize },

    /// `CheckpointStrategy::Every(0)`.
    #[error("checkpoint interval must be positive")]
    InvalidCheckpointInterval,

    /// `use_gates` is set but no gate tensor was supplied.
    #[error("gates are enabled but no gate tensor was supplied")]
    GatesMissing,

    /// A gate tensor was supplied while `use_gates` is off.
    #[error("a gate tensor was supplied but gates are disabled")]
    GatesUnexpected,

    /// Malformed variable-length segment offsets.
    #[error("invalid sequence offsets: {0}")]
    InvalidSegments(String),

    /// Backward was asked to run with a chunk layout other than the one the
    /// forward pass saved.
    #[error("saved context was recorded with chunk length {saved}, backward requested {requested}")]
    ChunkLayoutMismatch { saved: usize, requested: usize },

    /// Invalid configuration value.
    #[error("invalid configuration `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    /// Recurrent state could not be encoded or decoded.
    #[error("state serialisation failed: {0}")]
    Serialization(#[from] bincode::Error),
}

impl ScanError {
    /// Shorthand for a [`ScanError::Shape`] error.
    pub fn shape(tensor: &'static str, detail: impl Into<String>) -> Self {
        Self::Shape {
            tensor,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_message_names_tensor() {
        let err = ScanError::shape("key", "expected seq_len 6, got 5");
        let msg = err.to_string();
        assert!(msg.contains("`key`"));
        assert!(msg.contains("expected seq_len 6"));
    }

    #[test]
    fn test_layout_mismatch_message() {
        let err = ScanError::ChunkLayoutMismatch {
            saved: 16,
            requested: 8,
        };
        assert!(err.to_string().contains("16"));
    }
}
