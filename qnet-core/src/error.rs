use thiserror::Error;

/// The seven error kinds of the node's error taxonomy (§7). Every fallible
/// operation in the core crates returns one of these, never a raw string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QNetError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stale: {0}")]
    Stale(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("partition: {0}")]
    Partition(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl QNetError {
    /// Short machine-readable tag, used by the RPC layer's `{error, message}` shape.
    pub fn kind(&self) -> &'static str {
        match self {
            QNetError::InvalidInput(_) => "invalid_input",
            QNetError::Unauthorized(_) => "unauthorized",
            QNetError::Conflict(_) => "conflict",
            QNetError::NotFound(_) => "not_found",
            QNetError::Stale(_) => "stale",
            QNetError::Transient(_) => "transient",
            QNetError::Partition(_) => "partition",
            QNetError::Fatal(_) => "fatal",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type QNetResult<T> = Result<T, QNetError>;
