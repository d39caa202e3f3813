use oxalert_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Storage: {0}")]
    Storage(#[from] StorageError),

    #[error("Source: {0}")]
    Source(String),

    #[error("Source: remote metric source is not configured")]
    RemoteNotConfigured,

    #[error("Expression: {0}")]
    Expression(#[from] crate::expression::ExprError),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Trigger {0} is being checked elsewhere")]
    Locked(String),
}

pub type Result<T> = std::result::Result<T, CheckError>;
