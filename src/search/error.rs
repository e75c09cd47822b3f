use crate::storage::StoreError;
use thiserror::Error;

/// Errors raised while compiling or running a search query.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A single malformed term rejects the whole query.
    #[error("invalid search term: {0}")]
    InvalidSearchTerm(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SearchError {
    pub fn invalid_term(term: impl Into<String>) -> Self {
        SearchError::InvalidSearchTerm(term.into())
    }
}
