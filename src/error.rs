use crate::models::{MessageKey, ProjectId};
use crate::search::SearchError;
use crate::storage::StoreError;
use crate::sync::parser::ParseMessageError;
use thiserror::Error;

/// Top-level error returned by tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Parse(#[from] ParseMessageError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("unknown project `{0}`")]
    UnknownProject(String),
    #[error("no project with id {0}")]
    ProjectNotFound(ProjectId),
    #[error("message {0} not found")]
    MessageNotFound(MessageKey),
    #[error("message {0} is not a series head")]
    NotSeriesHead(MessageKey),
    #[error("invalid queue name `{0}`")]
    InvalidQueueName(String),
    #[error("failed to build import thread pool: {0}")]
    ThreadPool(String),
    #[error("invalid tag name pattern: {0}")]
    TagPattern(#[from] regex::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode property value: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Errors caused by the input rather than by the tracker itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TrackerError::Parse(_)
                | TrackerError::Search(SearchError::InvalidSearchTerm(_))
                | TrackerError::UnknownProject(_)
                | TrackerError::MessageNotFound(_)
                | TrackerError::NotSeriesHead(_)
                | TrackerError::InvalidQueueName(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_search_terms_are_client_errors() {
        let err: TrackerError = SearchError::InvalidSearchTerm("age:xyz".into()).into();
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "invalid search term: age:xyz");
    }

    #[test]
    fn json_errors_convert() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TrackerError = err.into();
        assert!(matches!(err, TrackerError::Json(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn store_timeouts_are_not_client_errors() {
        let err: TrackerError = StoreError::Timeout.into();
        assert!(!err.is_client_error());
    }
}
