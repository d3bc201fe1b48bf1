use crate::models::SourceId;

/// Errors surfaced by the library.
///
/// Variants map to the failure classes callers need to tell apart:
/// configuration problems are permanent and raised at bind time, provider
/// and database failures flow through the queue's retry policy, and
/// validation errors are returned straight to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or incomplete configuration (unknown format, missing api_key,
    /// chunking bound above the service max, unknown service name).
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller-supplied value failed validation (dimension mismatch,
    /// text filter without text storage, non-positive limit).
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote embedding provider failed (non-success HTTP or transport).
    #[error("provider error: {0}")]
    Provider(String),

    /// Database I/O failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An embedding row for this hash already belongs to a different service.
    /// Content hashes never migrate between vector spaces.
    #[error("hash already stored under a different embedding service")]
    ServiceMismatch,

    /// Refusing to delete a service that still owns data. Pass `force`
    /// to cascade.
    #[error("service still has {embeddings} embeddings and {chunks} chunks; use force to delete")]
    ServiceInUse { embeddings: i64, chunks: i64 },

    /// A queue item exhausted its retries and went terminal.
    #[error("indexing {source_type}/{source_id} failed after {attempts} attempts: {message}")]
    QueueItemFailed {
        source_type: String,
        source_id: SourceId,
        attempts: i64,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
