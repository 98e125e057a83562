//! Error types for sasred-core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for reduction operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, raised before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shape disagreement between paired arrays or stage inputs.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Malformed grid frame selection string.
    #[error("invalid frame selection '{selection}': {reason}")]
    InvalidSelection { selection: String, reason: String },

    /// Stage input violates a stage precondition.
    #[error("invalid stage input: {0}")]
    InvalidInput(String),
}
