/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use oxalert_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "trigger",
///     id: "t-99".to_string(),
/// };
/// assert!(err.to_string().contains("trigger"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure of a stored record.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend is not reachable.
    #[error("Storage: store unavailable")]
    Unavailable,

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
