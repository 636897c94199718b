//! Error types for empacar
//!
//! All fallible operations return [`Result`] with [`EmpacarError`].
//! Messages carry the offending tensor name, file path, or shape check so
//! a failed export can be diagnosed without re-running under a debugger.

use thiserror::Error;

/// Result type alias for empacar operations
pub type Result<T> = std::result::Result<T, EmpacarError>;

/// Error type for all empacar operations
#[derive(Debug, Error)]
pub enum EmpacarError {
    /// A required named source tensor is absent from the weight source.
    ///
    /// Fatal to the whole export: a partial weight set is unusable and a
    /// silent gap would misalign downstream layer indexing.
    #[error("Missing input tensor: {name}")]
    MissingInput {
        /// Name of the absent tensor
        name: String,
    },

    /// Inconsistent or truncated binary data
    #[error("Format error: {reason}")]
    FormatError {
        /// What the reader found
        reason: String,
    },

    /// Invalid configuration detected before any computation
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Which check failed
        reason: String,
    },

    /// Tensor shape violates an operation's requirements
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Which shape check failed
        reason: String,
    },

    /// Data buffer length does not match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual buffer length
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Product of the declared shape
        expected: usize,
    },

    /// File I/O failure
    #[error("I/O error: {message}")]
    IoError {
        /// Underlying failure with path context
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_input_names_tensor() {
        let err = EmpacarError::MissingInput {
            name: "model.layers.3.self_attn.q_proj.weight".to_string(),
        };
        assert!(err.to_string().contains("q_proj"));
    }

    #[test]
    fn test_data_shape_mismatch_display() {
        let err = EmpacarError::DataShapeMismatch {
            data_size: 5,
            shape: vec![2, 3],
            expected: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('6'));
    }
}
