//! Error types shared across the search engine.

use thiserror::Error;

/// Error types for search engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    /// An index was outside the valid range of a container.
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: usize, size: usize },

    /// Layers or images with incompatible dimensions were combined.
    #[error("dimension mismatch: expected {expected:?} (height, width), got {actual:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A caller-supplied parameter was out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The data currently resides on the accelerator and cannot be
    /// touched from the host until it is moved back.
    #[error("data resides on the accelerator; move it to the host first")]
    DataOnGpu,

    /// Results were requested before any search populated them.
    #[error("no results available; run a search first")]
    NoResults,

    /// An accelerator-only operation was invoked in a build without
    /// accelerator support.
    #[error("{0} requires accelerator support, which this build lacks")]
    NotImplemented(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SearchError>;
