use oxalert_storage::StorageError;

/// Errors that can occur within the notification subsystem.
///
/// Senders themselves return `anyhow::Result`; their failures are wrapped in
/// [`NotifyError::Sender`] by the dispatcher.
///
/// # Examples
///
/// ```rust
/// use oxalert_notify::error::NotifyError;
///
/// let err = NotifyError::UnknownSenderType("pager".to_string());
/// assert!(err.to_string().contains("pager"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// No sender is registered for the contact type.
    #[error("Notify: unknown sender type '{0}'")]
    UnknownSenderType(String),

    /// Sender settings are missing a required key or contain an invalid value.
    #[error("Notify: invalid sender configuration: {0}")]
    InvalidConfig(String),

    /// The sender did not finish within the sending timeout.
    #[error("Notify: send timed out after {0} ms")]
    Timeout(u64),

    /// The sender reported a delivery failure.
    #[error("Notify: sender failed: {0}")]
    Sender(String),

    /// Reading or writing the store failed.
    #[error("Notify: {0}")]
    Storage(#[from] StorageError),

    /// Generic notification error for cases not covered by other variants.
    #[error("Notify: {0}")]
    Other(String),
}

/// Convenience `Result` alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
