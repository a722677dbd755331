//! Error handling for the kdpack library
//!
//! User-level failures (invalid tree construction, malformed headers) are
//! reported through [`KdpackError`]. Violations of internal assembly
//! invariants are programming errors and are checked with assertions instead.

use thiserror::Error;

/// Main error type for the kdpack library
#[derive(Error, Debug)]
pub enum KdpackError {
    /// Cutting-plane distance rejected at tree construction
    #[error("Invalid distance: {message}")]
    InvalidDistance {
        /// Description of the failing distance value
        message: String,
    },

    /// Distance length outside `1..=7` or inconsistent between parent and child
    #[error("Invalid distance length: {message}")]
    InvalidDistanceLength {
        /// Description of the failing length
        message: String,
    },

    /// Leaf payload at or beyond the overflow sentinel
    #[error("Leaf count overflow: {count} words (limit {limit})")]
    LeafOverflow {
        /// Number of payload words supplied
        count: usize,
        /// Maximum representable count
        limit: usize,
    },

    /// Encoded image rejected (bad magic or truncated header)
    #[error("Invalid image: {message}")]
    InvalidImage {
        /// Description of the failing image
        message: String,
    },
}

impl KdpackError {
    /// Create an invalid-distance error
    pub fn invalid_distance<S: Into<String>>(message: S) -> Self {
        Self::InvalidDistance {
            message: message.into(),
        }
    }

    /// Create an invalid-distance-length error
    pub fn invalid_distance_length<S: Into<String>>(message: S) -> Self {
        Self::InvalidDistanceLength {
            message: message.into(),
        }
    }

    /// Create a leaf-overflow error
    pub fn leaf_overflow(count: usize, limit: usize) -> Self {
        Self::LeafOverflow { count, limit }
    }

    /// Create an invalid-image error
    pub fn invalid_image<S: Into<String>>(message: S) -> Self {
        Self::InvalidImage {
            message: message.into(),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidDistance { .. } => "distance",
            Self::InvalidDistanceLength { .. } => "distance_length",
            Self::LeafOverflow { .. } => "leaf",
            Self::InvalidImage { .. } => "image",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, KdpackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = KdpackError::invalid_distance("too large");
        assert_eq!(err.category(), "distance");
        let display = format!("{}", err);
        assert!(display.contains("Invalid distance"));
        assert!(display.contains("too large"));
    }

    #[test]
    fn test_leaf_overflow_display() {
        let err = KdpackError::leaf_overflow(0xFFFF, 0xFFFE);
        assert_eq!(err.category(), "leaf");
        let display = format!("{}", err);
        assert!(display.contains("65535"));
        assert!(display.contains("65534"));
    }

    #[test]
    fn test_error_debug() {
        let err = KdpackError::invalid_image("bad magic");
        let debug = format!("{:?}", err);
        assert!(debug.contains("InvalidImage"));
        assert!(debug.contains("bad magic"));
    }
}
