use thiserror::Error;

/// Failures that can end a pipeline run or a chat store operation.
#[derive(Debug, Error)]
pub enum RagError {
    /// The requested folder does not exist in the document source.
    #[error("folder not found: {0}")]
    NotFound(String),

    /// The document source refused or failed the request (permissions, network, quota).
    #[error("failed to access documents: {0}")]
    Access(String),

    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    #[error("generation error: {0}")]
    Generation(String),

    /// Reuse was requested but no index has been persisted for the folder.
    #[error("no index persisted for folder {0}")]
    IndexNotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The vector index backend failed to read or write its state.
    #[error("vector index error: {0}")]
    IndexStorage(String),

    /// A blocking worker panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RagError {
    /// HTTP status code the boundary should answer with.
    pub fn status(&self) -> u16 {
        match self {
            RagError::Validation(_) => 400,
            _ => 500,
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RagError::Validation("missing".into()).status(), 400);
        assert_eq!(RagError::NotFound("F1".into()).status(), 500);
        assert_eq!(RagError::IndexNotFound("F1".into()).status(), 500);
    }

    #[tokio::test]
    async fn test_panicked_worker_is_a_server_error() {
        let join_err = tokio::task::spawn_blocking(|| panic!("hash worker died"))
            .await
            .unwrap_err();
        let err = RagError::from(join_err);
        assert!(matches!(err, RagError::Task(_)));
        assert_eq!(err.status(), 500);
        assert!(err.to_string().starts_with("background task failed"));
    }

    #[test]
    fn test_messages_embed_detail() {
        let err = RagError::Generation("No response generated".into());
        assert_eq!(err.to_string(), "generation error: No response generated");
    }
}
