use thiserror::Error;
use uuid::Uuid;

use crate::services::ingestion::SkippedEntry;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub(crate) enum ServiceError {
    #[error("{message}")]
    Validation { message: String, skipped: Vec<SkippedEntry> },
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("{0} is still referenced and cannot be removed")]
    ReferencedResource(&'static str),
    #[error("{0}")]
    IncompleteReview(String),
    #[error("review is incomplete: {} essay(s) not reviewed", unreviewed.len())]
    ReviewIncomplete { unreviewed: Vec<Uuid> },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition { entity: &'static str, from: &'static str, to: &'static str },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(&'static str),
    #[error(transparent)]
    Store(anyhow::Error),
}

impl ServiceError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), skipped: Vec::new() }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Referenced(what) => Self::ReferencedResource(what),
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Backend(err) => Self::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_service_taxonomy() {
        assert!(matches!(
            ServiceError::from(StoreError::Referenced("rubric")),
            ServiceError::ReferencedResource("rubric")
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Conflict("dup".into())),
            ServiceError::Conflict(message) if message == "dup"
        ));
    }

    #[test]
    fn review_incomplete_message_counts_essays() {
        let err = ServiceError::ReviewIncomplete { unreviewed: vec![Uuid::new_v4(), Uuid::new_v4()] };
        assert_eq!(err.to_string(), "review is incomplete: 2 essay(s) not reviewed");
    }
}
