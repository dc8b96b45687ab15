use arrow_schema::ArrowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("empty list of columns queried")]
    EmptyColumnList,
    #[error("column queried more than once: {0}")]
    DuplicateColumn(String),
    /// Transient: the table was dropped or detached while it was being read.
    #[error("table unavailable: {0}")]
    TableUnavailable(String),
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Errors that mean "skip this table and keep scanning".
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TableUnavailable(_))
    }
}

impl From<ArrowError> for EngineError {
    fn from(e: ArrowError) -> Self {
        EngineError::Internal(format!("arrow: {e}"))
    }
}
