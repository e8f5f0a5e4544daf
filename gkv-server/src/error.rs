//! Error types for the reference node.

use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The query could not be parsed or evaluated.
    #[error("{0}")]
    Query(String),

    #[error("region `{0}` not found")]
    NoRegion(String),
}

impl ServerError {
    pub(crate) fn query(message: impl Into<String>) -> Self {
        ServerError::Query(message.into())
    }
}
