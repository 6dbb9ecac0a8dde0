use thiserror::Error;

use crate::db::BackendError;

/// Errors raised by table generation, identity resolution and statement building.
#[derive(Debug, Error)]
pub enum TriageError {
    /// Neither a query nor a labels table was configured.
    #[error("no cohort definition available: {0}")]
    Configuration(String),

    /// Generation finished but the table holds no rows.
    #[error("{0}")]
    EmptyResult(String),

    #[error("Duplicates found in {table}!")]
    DuplicateKey { table: String },

    /// A routine needed to resolve model groups is absent on the backend.
    #[error("missing capability: {0}")]
    MissingCapability(String),

    #[error("matrix metadata has no key {0:?}")]
    MissingMetadata(String),

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid interval {0:?}")]
    InvalidInterval(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TriageError>;

impl TriageError {
    /// The underlying native failure, if this error came from the backend.
    pub fn as_backend(&self) -> Option<&BackendError> {
        match self {
            TriageError::Backend(err) => Some(err),
            _ => None,
        }
    }
}
