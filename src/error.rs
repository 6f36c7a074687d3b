//! Error taxonomy shared by the classifier, ledger and aggregator.

use crate::db::{AnomalyStatus, DbError};
use thiserror::Error;

/// Errors surfaced by the anomaly ledger and the aggregator.
///
/// The core never retries or recovers from these; callers decide how to
/// present them.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("anomaly {id} is already {status}")]
    InvalidTransition { id: i64, status: AnomalyStatus },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(DbError),
}

impl CoreError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::Store(_) => "store",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => Self::NotFound(what),
            DbError::Duplicate(what) => Self::Conflict(what),
            other => Self::Store(other),
        }
    }
}
