//! Core data types stored and returned by the engine.
//!
//! The content hash is identity: a chunk of text has a unique SHA-256
//! digest, and the embedding, the projection, and (optionally) the stored
//! text are all keyed by that digest. Multiple [`ChunkRecord`]s may point
//! at the same hash, which is how identical content is deduplicated
//! without losing provenance.
//!
//! ```text
//! text → split → [chunk text] ─┬─ hash ──▶ embeddings (one per hash)
//!                              │              │
//!                              │              └─▶ projections (lockstep)
//!                              ├─▶ chunks (one per source reference)
//!                              └─▶ texts (optional, per hash)
//! ```

/// 32-byte SHA-256 digest of a chunk's UTF-8 text.
pub type ContentHash = [u8; 32];

/// Application-side 64-bit key identifying a document within a source type.
pub type SourceId = i64;

/// A named embedding service: one row in `services`, one vector space.
///
/// Embeddings are comparable only within a single service; `dimensions`
/// fixes the length of every vector stored under it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingService {
    /// Rowid primary key.
    pub id: i64,
    /// Unique name; synthesized as `"{format}/{model}"` when not given.
    pub name: String,
    /// Provider protocol, e.g. `"openai"` or `"mock"`.
    pub format: String,
    /// Optional endpoint override for the provider.
    pub base_url: Option<String>,
    /// Model identifier sent to the provider.
    pub model: String,
    /// Vector length; every embedding row under this service decodes to
    /// exactly this many floats.
    pub dimensions: i64,
    /// Upper bound on tokens per embedded chunk.
    pub max_tokens: i64,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// A source reference to embedded content: one row in `chunks`.
///
/// `(source_type, source_id, offset)` is unique; `hash` points into
/// `embeddings` and may be shared with other chunks.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: i64,
    pub hash: ContentHash,
    /// Short application-defined tag, e.g. `"event"` or `"note"`.
    pub source_type: String,
    pub source_id: SourceId,
    /// Optional relation to a paired document.
    pub pair_id: Option<i64>,
    /// Optional relation to a parent document.
    pub parent_id: Option<i64>,
    /// Cumulative character position of this chunk within its source.
    pub offset: Option<i64>,
    /// Character count of the chunk text.
    pub size: i64,
    /// Number of searches that returned this chunk. Never decreases.
    pub match_count: i64,
    /// Number of explicit reads recorded via `mark_as_read`.
    pub read_count: i64,
    pub created_at: i64,
}

/// Queue status codes for `embed_queue.status`.
///
/// `-1` pending, `0` success, `>= 1` terminal failure (the stored value is
/// the attempt count at the time the item went terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Success,
    Failed(i64),
}

impl QueueStatus {
    pub const PENDING: i64 = -1;
    pub const SUCCESS: i64 = 0;

    pub fn from_code(code: i64) -> Self {
        match code {
            Self::PENDING => QueueStatus::Pending,
            Self::SUCCESS => QueueStatus::Success,
            n => QueueStatus::Failed(n),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            QueueStatus::Pending => Self::PENDING,
            QueueStatus::Success => Self::SUCCESS,
            QueueStatus::Failed(n) => n,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }
}

/// One row of the durable ingestion queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub source_type: String,
    pub source_id: SourceId,
    /// Payload text, possibly carrying the one-line relation-metadata
    /// prefix (see [`crate::queue::encode_meta`]).
    pub text: String,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub chunk: ChunkRecord,
    /// Cosine similarity against the query embedding, in `[-1, 1]`.
    pub score: f64,
    /// Stored chunk text, populated only when `include_text` was requested.
    pub text: Option<String>,
}

/// Counts scoped to one embedding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStats {
    /// Distinct embedded contents (unique hashes).
    pub embeddings: i64,
    /// Source references.
    pub chunks: i64,
    /// Distinct `(source_type, source_id)` pairs.
    pub sources: i64,
}

/// Queue health counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub succeeded: i64,
    pub failed: i64,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
