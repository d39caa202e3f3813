use oxalert_storage::StorageError;

/// Errors raised by the filter.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// A metric line that cannot be parsed.
    #[error("Filter: invalid metric line: {0}")]
    InvalidLine(String),

    /// A pattern that cannot be compiled into the index.
    #[error("Filter: invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Filter: {0}")]
    Storage(#[from] StorageError),

    /// The pipeline has shut down and no longer accepts lines.
    #[error("Filter: pipeline closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FilterError>;
