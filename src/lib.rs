//! # memodb
//!
//! **An embeddable semantic-search engine for text.**
//!
//! memodb ingests application-supplied documents, produces dense vector
//! embeddings through a pluggable provider, stores them content-addressed
//! in local SQLite, and answers nearest-neighbor queries ranked by cosine
//! similarity. Text storage is optional and enables substring (`LIKE`) and
//! full-text (FTS5) filtering; auxiliary application databases can be
//! attached so searches can join against arbitrary application predicates.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────┐   ┌────────────────┐
//! │  index() │──▶│    embed_queue      │──▶│ chunk → embed  │
//! └──────────┘   │ (durable, retried)  │   │ → project      │
//!                └─────────────────────┘   └───────┬────────┘
//!                                                  ▼ one tx/doc
//! ┌──────────┐   ┌─────────────────────────────────────────────┐
//! │ search() │──▶│ SQLite: services · embeddings · chunks ·    │
//! └──────────┘   │ projections │ text_store: texts · texts_fts │
//!                └─────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`Service::index`] enqueues the document and drives the queue item
//!    through the chunker ([`chunk`]), the embedding provider
//!    ([`embedding`]), and the projection engine ([`projection`]).
//! 2. Every chunk is stored under its SHA-256 content hash: one embedding
//!    and one projection row per unique content, one chunk row per source
//!    reference ([`store`]). Identical content deduplicates for free.
//! 3. [`Service::search`] embeds the query, prunes candidates by
//!    projection distance inside SQLite, scores survivors by cosine
//!    similarity, and keeps a bounded top-k ([`search`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use memodb::{Service, ServiceConfig, SearchParams};
//!
//! # async fn example() -> memodb::Result<()> {
//! let mut config = ServiceConfig::new("./data");
//! config.format = Some("openai".into());
//! config.model = Some("text-embedding-3-small".into());
//! config.dimensions = Some(1536);
//! config.max_tokens = Some(8191);
//! config.api_key = std::env::var("OPENAI_API_KEY").ok();
//!
//! let service = Service::bind(config).await?;
//! service.index("note", 1, "The quick brown fox", None, None).await?;
//!
//! let results = service
//!     .search("fox", &SearchParams { min_score: 0.2, ..Default::default() })
//!     .await?;
//! # service.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Service configuration, TOML loading, validation |
//! | [`models`] | Core data types: services, chunks, queue items, matches |
//! | [`chunk`] | Token-estimate paragraph/sentence chunker |
//! | [`embedding`] | Provider trait, HTTP + mock providers, vector codec |
//! | [`projection`] | Orthonormal random projections for kNN pre-filtering |
//! | [`store`] | Content-addressed storage primitives and transactions |
//! | [`search`] | Composed top-k scan with metadata/text/SQL filters |
//! | [`queue`] | Durable ingestion queue with bounded retries |
//! | [`service`] | The [`Service`] facade binding all of the above |
//! | [`db`] | SQLite pool with WAL mode and schema attaches |
//! | [`migrate`] | Idempotent schema creation |
//! | [`error`] | Typed error kinds |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod migrate;
pub mod models;
pub mod projection;
pub mod queue;
pub mod search;
pub mod service;
pub mod store;

pub use config::{load_config, ServiceConfig};
pub use embedding::{EmbeddingBatch, EmbeddingProvider, ProviderRegistry, ProviderSpec};
pub use error::{Error, Result};
pub use models::{
    ChunkRecord, ContentHash, EmbeddingService, QueueItem, QueueStats, QueueStatus, SearchMatch,
    ServiceStats, SourceId,
};
pub use projection::{ProjectionMatrix, DEFAULT_PROJECTION_THRESHOLD, PROJECTION_K};
pub use queue::ProcessOutcome;
pub use search::SearchParams;
pub use service::Service;
pub use store::content_hash;
