//! High-level service facade.
//!
//! A [`Service`] binds a data directory, a database connection with its
//! attached text and auxiliary schemas, one embedding service record, and
//! that service's projection vectors. It exposes the full engine surface:
//! index, search, delete, reindex, stats, queue management, and a CRUD
//! facade over embedding services.
//!
//! Construction is fallible in several stages; the pool is released on
//! every failing exit path when this service opened it. A service handed
//! an existing pool never closes it.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::db;
use crate::embedding::{EmbeddingProvider, ProviderRegistry, ProviderSpec};
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{
    ContentHash, EmbeddingService, QueueItem, QueueStats, SearchMatch, ServiceStats, SourceId,
};
use crate::projection::ProjectionMatrix;
use crate::queue::{ProcessOutcome, QueueProcessor};
use crate::search::{run_search, SearchParams};
use crate::store::{Store, TableNames};

/// An open semantic-search engine bound to one embedding service.
pub struct Service {
    store: Store,
    pool: SqlitePool,
    owns_pool: bool,
    config: ServiceConfig,
    service: EmbeddingService,
    provider: Arc<dyn EmbeddingProvider>,
    projection: Arc<ProjectionMatrix>,
    processor: QueueProcessor,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Open (creating if needed) the databases in `config.data_dir` and
    /// bind the configured embedding service, with the built-in provider
    /// formats.
    pub async fn bind(config: ServiceConfig) -> Result<Self> {
        Self::bind_with_registry(config, &ProviderRegistry::with_builtins()).await
    }

    /// As [`bind`](Self::bind), with a caller-supplied provider registry.
    pub async fn bind_with_registry(
        config: ServiceConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let aux: Vec<(String, std::path::PathBuf)> = config
            .attach
            .iter()
            .map(|(alias, path)| (alias.clone(), path.clone()))
            .collect();
        let pool = db::connect(&config.data_dir, config.store_text, aux).await?;

        match Self::init(pool.clone(), config, true, registry).await {
            Ok(service) => Ok(service),
            Err(e) => {
                pool.close().await;
                Err(e)
            }
        }
    }

    /// Bind onto a pool the caller owns. The caller is responsible for
    /// any schema attaches (text storage expects the text database under
    /// the `text_store` alias) and [`close`](Self::close) will not close
    /// the pool.
    pub async fn bind_with_pool(pool: SqlitePool, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        Self::init(pool, config, false, &ProviderRegistry::with_builtins()).await
    }

    async fn init(
        pool: SqlitePool,
        config: ServiceConfig,
        owns_pool: bool,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        let text_schema = config.store_text.then_some(db::TEXT_SCHEMA);
        migrate::run_migrations(&pool, &config.table_prefix, text_schema).await?;

        let names = TableNames::new(&config.table_prefix, text_schema);
        let store = Store::new(pool.clone(), names);

        let service = match &config.service {
            Some(name) => store.get_service(name).await?.ok_or_else(|| {
                Error::Config(format!("unknown embedding service '{}'", name))
            })?,
            None => {
                // Presence of the tuple was checked by validate().
                store
                    .register_service(
                        None,
                        config.format.as_deref().unwrap_or_default(),
                        config.model.as_deref().unwrap_or_default(),
                        config.dimensions.unwrap_or_default(),
                        config.max_tokens.unwrap_or_default(),
                        config.base_url.as_deref(),
                    )
                    .await?
            }
        };

        if config.chunking_max_tokens > service.max_tokens {
            return Err(Error::Config(format!(
                "chunking_max_tokens {} exceeds service max_tokens {}",
                config.chunking_max_tokens, service.max_tokens
            )));
        }

        let spec = ProviderSpec {
            format: service.format.clone(),
            base_url: service.base_url.clone().or_else(|| config.base_url.clone()),
            model: service.model.clone(),
            dimensions: service.dimensions as usize,
            api_key: config.api_key.clone(),
            timeout: std::time::Duration::from_secs(config.request_timeout_secs),
        };
        let provider = registry.create(&spec)?;

        let projection = Arc::new(
            store
                .ensure_projection_vectors(service.id, service.dimensions as usize)
                .await?,
        );

        let processor = QueueProcessor::new(
            store.clone(),
            Arc::clone(&provider),
            Arc::clone(&projection),
            config.chunking(),
            service.id,
            config.store_text,
            config.batch_size,
            config.max_retries,
        );

        info!(
            target: "memodb::service",
            service = %service.name,
            dimensions = service.dimensions,
            "bound"
        );

        Ok(Self {
            store,
            pool,
            owns_pool,
            config,
            service,
            provider,
            projection,
            processor,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// The bound embedding service record.
    pub fn service(&self) -> &EmbeddingService {
        &self.service
    }

    // ============ Ingestion ============

    /// Index one document synchronously: enqueue, then process that item.
    /// Surfaces [`Error::QueueItemFailed`] once the item exhausts its
    /// retries.
    pub async fn index(
        &self,
        source_type: &str,
        source_id: SourceId,
        text: &str,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<()> {
        self.processor
            .enqueue(source_type, source_id, text, pair_id, parent_id)
            .await?;
        self.processor
            .process_queue_item(source_type, source_id)
            .await
    }

    /// Queue a document for later processing. Re-enqueuing an existing
    /// `(source_type, source_id)` replaces its text and resets the row to
    /// pending.
    pub async fn enqueue(
        &self,
        source_type: &str,
        source_id: SourceId,
        text: &str,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<()> {
        self.processor
            .enqueue(source_type, source_id, text, pair_id, parent_id)
            .await
    }

    /// Drain the queue synchronously.
    pub async fn process_queue(&self) -> Result<ProcessOutcome> {
        self.processor.process_queue().await
    }

    /// Drain the queue in a detached background task and return
    /// immediately. The task runs to queue exhaustion and reports nothing
    /// back; use [`process_queue`](Self::process_queue) when completion or
    /// errors matter. [`close`](Self::close) waits for in-flight tasks.
    pub async fn process_queue_in_background(&self) {
        let handle = self.processor.spawn();
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Delete every indexed tuple under `source_type` and re-enqueue each
    /// from its stored text (text storage) or the caller's lookup. The
    /// delete and the re-enqueue commit as one transaction; processing the
    /// re-enqueued items is a separate step.
    ///
    /// Returns the number of sources re-enqueued.
    pub async fn reindex(
        &self,
        source_type: &str,
        lookup: Option<&(dyn Fn(SourceId) -> Option<String> + Sync)>,
    ) -> Result<u64> {
        let sources = self
            .store
            .sources_for_type(self.service.id, source_type)
            .await?;
        if sources.is_empty() {
            return Ok(0);
        }

        let mut entries: Vec<(SourceId, String)> = Vec::with_capacity(sources.len());
        for (source_id, pair_id, parent_id) in sources {
            let text = if self.config.store_text {
                self.store
                    .text_for_source(self.service.id, source_type, source_id)
                    .await?
            } else {
                None
            };
            let text = match text.or_else(|| lookup.and_then(|f| f(source_id))) {
                Some(t) => t,
                None => {
                    debug!(
                        target: "memodb::service",
                        source_type,
                        source_id,
                        "no text available; source dropped from reindex"
                    );
                    continue;
                }
            };
            entries.push((source_id, crate::queue::encode_meta(&text, pair_id, parent_id)));
        }

        self.store
            .reindex_sources(self.service.id, source_type, &entries)
            .await?;
        Ok(entries.len() as u64)
    }

    // ============ Search ============

    /// Embed the query, project it, and run the top-k scan.
    pub async fn search(&self, query: &str, params: &SearchParams) -> Result<Vec<SearchMatch>> {
        let (query_vec, _) = self.provider.embed_text(query).await?;
        if query_vec.len() != self.service.dimensions as usize {
            return Err(Error::Validation(format!(
                "query embedding has {} dimensions, service expects {}",
                query_vec.len(),
                self.service.dimensions
            )));
        }
        let query_projection = self.projection.project(&query_vec)?;
        run_search(
            &self.store,
            self.service.id,
            &query_vec,
            Some(&query_projection),
            self.config.projection_threshold,
            params,
        )
        .await
    }

    /// Stored text for a content hash, when text storage is enabled.
    pub async fn get_text(&self, hash: &ContentHash) -> Result<Option<String>> {
        self.store.get_text(hash).await
    }

    // ============ Maintenance ============

    /// Delete all chunks referencing `source_id` (optionally narrowed to
    /// one source type) under this service, garbage-collecting embeddings
    /// and projections that lose their last reference. Returns the number
    /// of chunks deleted.
    pub async fn delete(&self, source_id: SourceId, source_type: Option<&str>) -> Result<u64> {
        self.store
            .delete_chunks_for_source(self.service.id, source_id, source_type)
            .await
    }

    /// Record explicit reads on the given chunks.
    pub async fn mark_as_read(&self, chunk_ids: &[i64]) -> Result<()> {
        self.store.increment_read_count(chunk_ids).await
    }

    /// Counts scoped to the bound service.
    pub async fn stats(&self) -> Result<ServiceStats> {
        self.store.stats(self.service.id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.store.queue_stats().await
    }

    /// Terminally failed queue items, oldest first.
    pub async fn failed_items(&self) -> Result<Vec<QueueItem>> {
        self.store.failed_items().await
    }

    /// Drop pending queue rows; returns how many were removed.
    pub async fn clear_pending(&self) -> Result<u64> {
        self.store.clear_pending().await
    }

    /// Drop terminally failed queue rows; returns how many were removed.
    pub async fn clear_failed(&self) -> Result<u64> {
        self.store.clear_failed().await
    }

    // ============ Services CRUD ============

    /// Register (or fetch, by name) an embedding service record.
    pub async fn register_service(
        &self,
        name: Option<&str>,
        format: &str,
        model: &str,
        dimensions: i64,
        max_tokens: i64,
        base_url: Option<&str>,
    ) -> Result<EmbeddingService> {
        self.store
            .register_service(name, format, model, dimensions, max_tokens, base_url)
            .await
    }

    pub async fn list_services(&self) -> Result<Vec<EmbeddingService>> {
        self.store.list_services().await
    }

    /// Delete a service by name. Without `force` this fails while the
    /// service still owns embeddings or chunks; with it, everything the
    /// service owns cascades away.
    pub async fn delete_service(&self, name: &str, force: bool) -> Result<()> {
        let service = self
            .store
            .get_service(name)
            .await?
            .ok_or_else(|| Error::Config(format!("unknown embedding service '{}'", name)))?;
        self.store.delete_service(service.id, force).await
    }

    // ============ Lifecycle ============

    /// Wait for detached background tasks, then close the pool if this
    /// service opened it. A service bound onto a caller's pool leaves the
    /// pool running.
    pub async fn close(self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
        drop(tasks);

        if self.owns_pool {
            self.pool.close().await;
        }
    }
}
