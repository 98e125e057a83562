//! I/O and pipeline error types.

use thiserror::Error;

/// Result type for store and pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store and pipeline error types.
#[derive(Error, Debug)]
pub enum Error {
    /// HDF5 library failure.
    #[error("storage error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Store misuse: bad window, shape mismatch, closed handle.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or inconsistent run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input file that should be skipped, not abort the batch.
    #[error("skippable input: {0}")]
    SkippableInput(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] sasred_core::Error),
}

impl Error {
    /// True when the per-file boundary should convert this error into a
    /// WARNING status instead of aborting the batch.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::SkippableInput(_))
    }
}
