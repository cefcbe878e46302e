//! Error type for the kernel layer.
//!
//! Kernels never panic on recoverable misuse: an undersized compute buffer or
//! a mismatched buffer length is reported through [`Result`] so the caller can
//! surface a clean failure. Malformed dimensions (row lengths that are not a
//! multiple of the block width, counter-pool overflow) indicate caller bugs
//! and are asserted instead.

use thiserror::Error;

/// Errors surfaced by the compute kernels.
#[derive(Debug, Error)]
pub enum DespertarError {
    /// The caller-provided scratch buffer cannot hold the working set of the
    /// forward call. Nothing observable has been written to the destination.
    #[error("The compute buffer is too small")]
    ComputeBufferTooSmall {
        /// Bytes the call needs, as computed by the workspace layout
        required: usize,
        /// Bytes the caller actually provided
        provided: usize,
    },

    /// A buffer length does not match the dimensions it was passed with
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Human-readable description of the mismatch
        reason: String,
    },
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DespertarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_buffer_too_small_message() {
        let err = DespertarError::ComputeBufferTooSmall {
            required: 1024,
            provided: 1023,
        };
        // External callers match on this exact message
        assert_eq!(err.to_string(), "The compute buffer is too small");
    }

    #[test]
    fn test_invalid_shape_message() {
        let err = DespertarError::InvalidShape {
            reason: "input length 31 is not a multiple of 32".to_string(),
        };
        assert!(err.to_string().starts_with("Invalid shape:"));
    }
}
