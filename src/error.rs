//! Error types for ivfpq-share.

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur during training, indexing, table construction and search.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// Empty index (no vectors indexed, or not enough to train).
    #[error("Index is empty")]
    EmptyIndex,
    /// Invalid parameter value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Quantizer shapes disagree with each other or with the declared dimension.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A quantizer was used before training completed.
    #[error("{0} is not trained")]
    NotTrained(&'static str),
    /// Dimension mismatch between query and index.
    #[error("Dimension mismatch: query has {query_dim} dimensions, index has {doc_dim}")]
    DimensionMismatch { query_dim: usize, doc_dim: usize },
    /// Operation not allowed in the current state (e.g. adding to a read-only index).
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Failure in the persistence layer.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, RetrieveError>;
