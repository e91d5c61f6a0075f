use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tideway-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Bulk deletes must be scoped; an empty prefix would match everything.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),
}

/// Errors from blob storage backends used by the claim-check manager.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob '{0}' not found")]
    NotFound(String),

    #[error("blob store backend error: {0}")]
    Backend(String),

    #[error("blob store misconfigured: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_invalid_prefix_display() {
        let err = RepositoryError::InvalidPrefix("prefix must not be empty".to_string());
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_blob_store_error_display() {
        let err = BlobStoreError::NotFound("claims/abc".to_string());
        assert_eq!(err.to_string(), "blob 'claims/abc' not found");
    }
}
