//! Storage primitives over the embeddings and text databases.
//!
//! Every piece of SQL the engine runs (except the search executor's
//! composed scan) lives here. The [`Store`] wraps the pool together with
//! the instance-scoped [`TableNames`], so two `Store`s with different
//! prefixes can share one database file without touching each other's
//! tables.
//!
//! Multi-statement flows (`store_document`, source deletion, service
//! cascade) each run under a single transaction; the per-row CRUD
//! operations are standalone and idempotent where the schema allows.

use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    now_ms, ChunkRecord, ContentHash, EmbeddingService, QueueItem, QueueStats, QueueStatus,
    ServiceStats, SourceId,
};
use crate::projection::{ProjectionMatrix, PROJECTION_K};

/// SHA-256 digest of the chunk's UTF-8 text: the content-addressed
/// identity everything else is keyed by.
pub fn content_hash(text: &str) -> ContentHash {
    Sha256::digest(text.as_bytes()).into()
}

/// Fully-resolved table names: instance prefix applied, text tables
/// qualified by their schema alias.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub services: String,
    pub embeddings: String,
    pub chunks: String,
    pub projections: String,
    pub projection_vectors: String,
    pub embed_queue: String,
    /// `"{schema}.{prefix}texts"`, present only with text storage.
    pub texts: Option<String>,
    pub texts_fts: Option<String>,
}

impl TableNames {
    pub fn new(prefix: &str, text_schema: Option<&str>) -> Self {
        Self {
            services: format!("{}services", prefix),
            embeddings: format!("{}embeddings", prefix),
            chunks: format!("{}chunks", prefix),
            projections: format!("{}projections", prefix),
            projection_vectors: format!("{}projection_vectors", prefix),
            embed_queue: format!("{}embed_queue", prefix),
            texts: text_schema.map(|s| format!("{}.{}texts", s, prefix)),
            texts_fts: text_schema.map(|s| format!("{}.{}texts_fts", s, prefix)),
        }
    }

    pub(crate) fn texts_required(&self) -> Result<&str> {
        self.texts
            .as_deref()
            .ok_or_else(|| Error::Validation("text storage is not enabled".into()))
    }

    pub(crate) fn texts_fts_required(&self) -> Result<&str> {
        self.texts_fts
            .as_deref()
            .ok_or_else(|| Error::Validation("text storage is not enabled".into()))
    }
}

/// A chunk row to insert during document storage.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub hash: ContentHash,
    pub text: String,
    pub offset: i64,
    pub size: i64,
}

/// A freshly-embedded content to persist alongside its projection.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub hash: ContentHash,
    pub vector: Vec<f32>,
    pub token_count: i64,
    pub projection: [f64; PROJECTION_K],
}

/// Handle over the open databases. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    names: Arc<TableNames>,
}

impl Store {
    pub fn new(pool: SqlitePool, names: TableNames) -> Self {
        Self {
            pool,
            names: Arc::new(names),
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn names(&self) -> &TableNames {
        &self.names
    }

    // ============ Services ============

    /// Look up a service by name, or insert a new row. An existing name is
    /// returned unchanged — the vector space of a name never changes.
    /// When `name` is unspecified, `"{format}/{model}"` is synthesized.
    pub async fn register_service(
        &self,
        name: Option<&str>,
        format: &str,
        model: &str,
        dimensions: i64,
        max_tokens: i64,
        base_url: Option<&str>,
    ) -> Result<EmbeddingService> {
        let synthesized;
        let name = match name {
            Some(n) => n,
            None => {
                synthesized = format!("{}/{}", format, model);
                &synthesized
            }
        };

        if let Some(existing) = self.get_service(name).await? {
            return Ok(existing);
        }

        let created_at = now_ms();
        let sql = format!(
            "INSERT INTO {} (name, format, base_url, model, dimensions, max_tokens, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.names.services
        );
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(format)
            .bind(base_url)
            .bind(model)
            .bind(dimensions)
            .bind(max_tokens)
            .bind(created_at)
            .execute(&self.pool)
            .await?;

        Ok(EmbeddingService {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            format: format.to_string(),
            base_url: base_url.map(str::to_string),
            model: model.to_string(),
            dimensions,
            max_tokens,
            created_at,
        })
    }

    pub async fn get_service(&self, name: &str) -> Result<Option<EmbeddingService>> {
        let sql = format!(
            "SELECT id, name, format, base_url, model, dimensions, max_tokens, created_at
             FROM {} WHERE name = ?",
            self.names.services
        );
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| service_from_row(&r)))
    }

    pub async fn list_services(&self) -> Result<Vec<EmbeddingService>> {
        let sql = format!(
            "SELECT id, name, format, base_url, model, dimensions, max_tokens, created_at
             FROM {} ORDER BY id",
            self.names.services
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(service_from_row).collect())
    }

    /// Delete a service. Refuses while the service still owns data unless
    /// `force` is set, in which case projections, embeddings, chunks,
    /// texts, and the projection vectors cascade away with it.
    pub async fn delete_service(&self, service_id: i64, force: bool) -> Result<()> {
        let stats = self.stats(service_id).await?;
        if !force && (stats.embeddings > 0 || stats.chunks > 0) {
            return Err(Error::ServiceInUse {
                embeddings: stats.embeddings,
                chunks: stats.chunks,
            });
        }

        let n = &*self.names;
        let mut tx = self.pool.begin().await?;

        let owned_hashes = format!("SELECT hash FROM {} WHERE service_id = ?", n.embeddings);

        if let (Some(texts), Some(fts)) = (&n.texts, &n.texts_fts) {
            // A hash belongs to exactly one service, so its text rows
            // cannot be referenced from elsewhere once the service goes.
            let sql = format!("DELETE FROM {} WHERE hash IN ({})", texts, owned_hashes);
            sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
            let sql = format!("DELETE FROM {} WHERE hash IN ({})", fts, owned_hashes);
            sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
        }

        let sql = format!("DELETE FROM {} WHERE hash IN ({})", n.chunks, owned_hashes);
        sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
        let sql = format!("DELETE FROM {} WHERE hash IN ({})", n.projections, owned_hashes);
        sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
        let sql = format!("DELETE FROM {} WHERE service_id = ?", n.embeddings);
        sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
        let sql = format!("DELETE FROM {} WHERE service_id = ?", n.projection_vectors);
        sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;
        let sql = format!("DELETE FROM {} WHERE id = ?", n.services);
        sqlx::query(&sql).bind(service_id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    // ============ Projection vectors ============

    /// Load the service's projection vectors, generating and persisting
    /// them on first use. The row is write-once: a concurrent generation
    /// loses the insert race and adopts the stored set.
    pub async fn ensure_projection_vectors(
        &self,
        service_id: i64,
        dimensions: usize,
    ) -> Result<ProjectionMatrix> {
        if let Some(existing) = self.load_projection_vectors(service_id).await? {
            return Ok(existing);
        }

        let generated = ProjectionMatrix::generate(dimensions)?;
        let blobs = generated.to_blobs();
        let sql = format!(
            "INSERT OR IGNORE INTO {}
             (service_id, vec_0, vec_1, vec_2, vec_3, vec_4, vec_5, vec_6, vec_7, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.names.projection_vectors
        );
        let mut query = sqlx::query(&sql).bind(service_id);
        for blob in &blobs {
            query = query.bind(blob.as_slice());
        }
        query.bind(now_ms()).execute(&self.pool).await?;

        self.load_projection_vectors(service_id)
            .await?
            .ok_or_else(|| Error::Validation("projection vectors missing after insert".into()))
    }

    pub async fn load_projection_vectors(
        &self,
        service_id: i64,
    ) -> Result<Option<ProjectionMatrix>> {
        let sql = format!(
            "SELECT vec_0, vec_1, vec_2, vec_3, vec_4, vec_5, vec_6, vec_7
             FROM {} WHERE service_id = ?",
            self.names.projection_vectors
        );
        let row = sqlx::query(&sql)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let blobs: Vec<Vec<u8>> = (0..PROJECTION_K)
                    .map(|i| row.get::<Vec<u8>, _>(i))
                    .collect();
                Ok(Some(ProjectionMatrix::from_blobs(&blobs)?))
            }
            None => Ok(None),
        }
    }

    // ============ Embeddings, projections, chunks, texts ============

    /// Which services already own each of the given hashes.
    pub async fn embedding_services_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<HashMap<ContentHash, i64>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT hash, service_id FROM {} WHERE hash IN ({})",
            self.names.embeddings,
            placeholders(hashes.len())
        );
        let mut query = sqlx::query(&sql);
        for hash in hashes {
            query = query.bind(hash.to_vec());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(decode_hash(row.get("hash"))?, row.get("service_id"));
        }
        Ok(map)
    }

    /// Insert an embedding, idempotently by hash. A hash already stored
    /// under a different service is rejected: vector spaces never mix
    /// under one content identity.
    pub async fn store_embedding(
        &self,
        hash: &ContentHash,
        vector: &[f32],
        token_count: i64,
        service_id: i64,
    ) -> Result<()> {
        let existing = self.embedding_services_for(&[*hash]).await?;
        if let Some(&owner) = existing.get(hash) {
            if owner != service_id {
                return Err(Error::ServiceMismatch);
            }
            return Ok(());
        }

        let sql = format!(
            "INSERT OR IGNORE INTO {} (hash, embedding, token_count, service_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
            self.names.embeddings
        );
        sqlx::query(&sql)
            .bind(hash.to_vec())
            .bind(vec_to_blob(vector))
            .bind(token_count)
            .bind(service_id)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_embedding(&self, hash: &ContentHash) -> Result<Option<Vec<f32>>> {
        let sql = format!(
            "SELECT embedding FROM {} WHERE hash = ?",
            self.names.embeddings
        );
        let row = sqlx::query(&sql)
            .bind(hash.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| blob_to_vec(&r.get::<Vec<u8>, _>("embedding"))))
    }

    /// Insert the projection row for a hash; lockstep companion of
    /// [`store_embedding`](Self::store_embedding).
    pub async fn store_projection(
        &self,
        hash: &ContentHash,
        projection: &[f64; PROJECTION_K],
    ) -> Result<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {}
             (hash, proj_0, proj_1, proj_2, proj_3, proj_4, proj_5, proj_6, proj_7)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.names.projections
        );
        let mut query = sqlx::query(&sql).bind(hash.to_vec());
        for value in projection {
            query = query.bind(*value);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Insert one source reference; `(source_type, source_id, offset)` is
    /// unique.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_chunk(
        &self,
        hash: &ContentHash,
        source_type: &str,
        source_id: SourceId,
        offset: Option<i64>,
        size: i64,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {}
             (hash, source_type, source_id, pair_id, parent_id, \"offset\", size, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.names.chunks
        );
        let result = sqlx::query(&sql)
            .bind(hash.to_vec())
            .bind(source_type)
            .bind(source_id)
            .bind(pair_id)
            .bind(parent_id)
            .bind(offset)
            .bind(size)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store chunk text, guarded against duplicate hashes in both the
    /// plain table and the FTS shadow table.
    pub async fn store_text(&self, hash: &ContentHash, content: &str) -> Result<()> {
        let texts = self.names.texts_required()?.to_string();
        let fts = self.names.texts_fts_required()?.to_string();

        let sql = format!(
            "INSERT INTO {t} (hash, content)
             SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE hash = ?)",
            t = texts
        );
        sqlx::query(&sql)
            .bind(hash.to_vec())
            .bind(content)
            .bind(hash.to_vec())
            .execute(&self.pool)
            .await?;

        let sql = format!(
            "INSERT INTO {t} (hash, content)
             SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE hash = ?)",
            t = fts
        );
        sqlx::query(&sql)
            .bind(hash.to_vec())
            .bind(content)
            .bind(hash.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_text(&self, hash: &ContentHash) -> Result<Option<String>> {
        let texts = self.names.texts_required()?;
        let sql = format!("SELECT content FROM {} WHERE hash = ?", texts);
        let row = sqlx::query(&sql)
            .bind(hash.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("content")))
    }

    /// Persist one ingested document under a single transaction: the
    /// source's previous chunks are replaced, new embeddings land with
    /// their projections, chunk rows go in emission order, and text rows
    /// are stored when enabled. Orphans left behind by the replacement are
    /// collected before commit.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_document(
        &self,
        service_id: i64,
        source_type: &str,
        source_id: SourceId,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
        chunks: &[ChunkInsert],
        new_embeddings: &[NewEmbedding],
        store_text: bool,
    ) -> Result<()> {
        let n = self.names.clone();
        let created_at = now_ms();
        let mut tx = self.pool.begin().await?;

        // Replace: remember what the source pointed at, then drop its rows.
        let sql = format!(
            "SELECT DISTINCT hash FROM {} WHERE source_type = ? AND source_id = ?
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, n.embeddings
        );
        let old_rows = sqlx::query(&sql)
            .bind(source_type)
            .bind(source_id)
            .bind(service_id)
            .fetch_all(&mut *tx)
            .await?;
        let old_hashes: Vec<ContentHash> = old_rows
            .into_iter()
            .map(|r| decode_hash(r.get("hash")))
            .collect::<Result<_>>()?;

        let sql = format!(
            "DELETE FROM {} WHERE source_type = ? AND source_id = ?
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, n.embeddings
        );
        sqlx::query(&sql)
            .bind(source_type)
            .bind(source_id)
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

        for emb in new_embeddings {
            let sql = format!(
                "INSERT OR IGNORE INTO {} (hash, embedding, token_count, service_id, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                n.embeddings
            );
            sqlx::query(&sql)
                .bind(emb.hash.to_vec())
                .bind(vec_to_blob(&emb.vector))
                .bind(emb.token_count)
                .bind(service_id)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;

            let sql = format!(
                "INSERT OR IGNORE INTO {}
                 (hash, proj_0, proj_1, proj_2, proj_3, proj_4, proj_5, proj_6, proj_7)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                n.projections
            );
            let mut query = sqlx::query(&sql).bind(emb.hash.to_vec());
            for value in &emb.projection {
                query = query.bind(*value);
            }
            query.execute(&mut *tx).await?;
        }

        for chunk in chunks {
            let sql = format!(
                "INSERT INTO {}
                 (hash, source_type, source_id, pair_id, parent_id, \"offset\", size, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                n.chunks
            );
            sqlx::query(&sql)
                .bind(chunk.hash.to_vec())
                .bind(source_type)
                .bind(source_id)
                .bind(pair_id)
                .bind(parent_id)
                .bind(chunk.offset)
                .bind(chunk.size)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;

            if store_text {
                let texts = n.texts_required()?;
                let fts = n.texts_fts_required()?;
                let sql = format!(
                    "INSERT INTO {t} (hash, content)
                     SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE hash = ?)",
                    t = texts
                );
                sqlx::query(&sql)
                    .bind(chunk.hash.to_vec())
                    .bind(chunk.text.as_str())
                    .bind(chunk.hash.to_vec())
                    .execute(&mut *tx)
                    .await?;
                let sql = format!(
                    "INSERT INTO {t} (hash, content)
                     SELECT ?, ? WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE hash = ?)",
                    t = fts
                );
                sqlx::query(&sql)
                    .bind(chunk.hash.to_vec())
                    .bind(chunk.text.as_str())
                    .bind(chunk.hash.to_vec())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let kept: HashSet<ContentHash> = chunks.iter().map(|c| c.hash).collect();
        let candidates: Vec<ContentHash> = old_hashes
            .into_iter()
            .filter(|h| !kept.contains(h))
            .collect();
        collect_orphans(&mut tx, &n, &candidates).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete all chunks of a source under this service, collecting
    /// orphaned embeddings, projections, and texts. Returns the number of
    /// chunks removed.
    pub async fn delete_chunks_for_source(
        &self,
        service_id: i64,
        source_id: SourceId,
        source_type: Option<&str>,
    ) -> Result<u64> {
        let n = self.names.clone();
        let mut tx = self.pool.begin().await?;

        let type_clause = match source_type {
            Some(_) => " AND source_type = ?",
            None => "",
        };
        let sql = format!(
            "SELECT DISTINCT hash FROM {} WHERE source_id = ?{}
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, type_clause, n.embeddings
        );
        let mut query = sqlx::query(&sql).bind(source_id);
        if let Some(st) = source_type {
            query = query.bind(st);
        }
        let rows = query.bind(service_id).fetch_all(&mut *tx).await?;
        let touched: Vec<ContentHash> = rows
            .into_iter()
            .map(|r| decode_hash(r.get("hash")))
            .collect::<Result<_>>()?;

        let sql = format!(
            "DELETE FROM {} WHERE source_id = ?{}
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, type_clause, n.embeddings
        );
        let mut query = sqlx::query(&sql).bind(source_id);
        if let Some(st) = source_type {
            query = query.bind(st);
        }
        let deleted = query.bind(service_id).execute(&mut *tx).await?.rows_affected();

        collect_orphans(&mut tx, &n, &touched).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Reindex a source type: drop every chunk indexed under it for this
    /// service and upsert a pending queue row per entry, all in one
    /// transaction. Processing the re-enqueued rows is a separate step.
    pub async fn reindex_sources(
        &self,
        service_id: i64,
        source_type: &str,
        entries: &[(SourceId, String)],
    ) -> Result<()> {
        let n = self.names.clone();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT DISTINCT hash FROM {} WHERE source_type = ?
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, n.embeddings
        );
        let rows = sqlx::query(&sql)
            .bind(source_type)
            .bind(service_id)
            .fetch_all(&mut *tx)
            .await?;
        let touched: Vec<ContentHash> = rows
            .into_iter()
            .map(|r| decode_hash(r.get("hash")))
            .collect::<Result<_>>()?;

        let sql = format!(
            "DELETE FROM {} WHERE source_type = ?
             AND hash IN (SELECT hash FROM {} WHERE service_id = ?)",
            n.chunks, n.embeddings
        );
        sqlx::query(&sql)
            .bind(source_type)
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

        collect_orphans(&mut tx, &n, &touched).await?;

        let sql = format!(
            "INSERT INTO {} (source_type, source_id, text, status, error_message, attempts, created_at, processed_at)
             VALUES (?, ?, ?, {pending}, NULL, 0, ?, NULL)
             ON CONFLICT(source_type, source_id) DO UPDATE SET
                 text = excluded.text,
                 status = {pending},
                 error_message = NULL,
                 attempts = 0,
                 processed_at = NULL",
            n.embed_queue,
            pending = QueueStatus::PENDING
        );
        for (source_id, text) in entries {
            sqlx::query(&sql)
                .bind(source_type)
                .bind(*source_id)
                .bind(text.as_str())
                .bind(now_ms())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Distinct `(source_id, pair_id, parent_id)` tuples indexed under a
    /// source type for this service. Feeds `reindex`.
    pub async fn sources_for_type(
        &self,
        service_id: i64,
        source_type: &str,
    ) -> Result<Vec<(SourceId, Option<i64>, Option<i64>)>> {
        let sql = format!(
            "SELECT DISTINCT c.source_id, c.pair_id, c.parent_id
             FROM {} c JOIN {} e ON c.hash = e.hash
             WHERE c.source_type = ? AND e.service_id = ?
             ORDER BY c.source_id",
            self.names.chunks, self.names.embeddings
        );
        let rows = sqlx::query(&sql)
            .bind(source_type)
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("source_id"), r.get("pair_id"), r.get("parent_id")))
            .collect())
    }

    /// Reconstruct a source's text from its stored chunk contents in
    /// offset order. Only available with text storage.
    pub async fn text_for_source(
        &self,
        service_id: i64,
        source_type: &str,
        source_id: SourceId,
    ) -> Result<Option<String>> {
        let texts = self.names.texts_required()?;
        let sql = format!(
            "SELECT t.content FROM {} c
             JOIN {} e ON c.hash = e.hash
             JOIN {} t ON t.hash = c.hash
             WHERE c.source_type = ? AND c.source_id = ? AND e.service_id = ?
             ORDER BY c.\"offset\" ASC",
            self.names.chunks, self.names.embeddings, texts
        );
        let rows = sqlx::query(&sql)
            .bind(source_type)
            .bind(source_id)
            .bind(service_id)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let pieces: Vec<String> = rows.iter().map(|r| r.get::<String, _>("content")).collect();
        Ok(Some(pieces.join("\n\n")))
    }

    // ============ Counters ============

    pub async fn increment_match_count(&self, chunk_ids: &[i64]) -> Result<()> {
        self.increment_counter("match_count", chunk_ids).await
    }

    pub async fn increment_read_count(&self, chunk_ids: &[i64]) -> Result<()> {
        self.increment_counter("read_count", chunk_ids).await
    }

    async fn increment_counter(&self, column: &str, chunk_ids: &[i64]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET {col} = {col} + 1 WHERE id IN ({})",
            self.names.chunks,
            placeholders(chunk_ids.len()),
            col = column
        );
        let mut query = sqlx::query(&sql);
        for id in chunk_ids {
            query = query.bind(*id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    // ============ Stats ============

    pub async fn stats(&self, service_id: i64) -> Result<ServiceStats> {
        let n = &*self.names;

        let sql = format!("SELECT COUNT(*) FROM {} WHERE service_id = ?", n.embeddings);
        let embeddings: i64 = sqlx::query_scalar(&sql)
            .bind(service_id)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT COUNT(*) FROM {} c JOIN {} e ON c.hash = e.hash WHERE e.service_id = ?",
            n.chunks, n.embeddings
        );
        let chunks: i64 = sqlx::query_scalar(&sql)
            .bind(service_id)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT COUNT(*) FROM (
                 SELECT DISTINCT c.source_type, c.source_id
                 FROM {} c JOIN {} e ON c.hash = e.hash WHERE e.service_id = ?
             )",
            n.chunks, n.embeddings
        );
        let sources: i64 = sqlx::query_scalar(&sql)
            .bind(service_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(ServiceStats {
            embeddings,
            chunks,
            sources,
        })
    }

    // ============ Queue rows ============

    /// Upsert a queue item keyed on `(source_type, source_id)`: a conflict
    /// replaces the text and resets the row to pending with zero attempts.
    /// `created_at` is preserved so re-enqueued items keep their place in
    /// FIFO order.
    pub async fn enqueue_item(
        &self,
        source_type: &str,
        source_id: SourceId,
        text: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (source_type, source_id, text, status, error_message, attempts, created_at, processed_at)
             VALUES (?, ?, ?, {pending}, NULL, 0, ?, NULL)
             ON CONFLICT(source_type, source_id) DO UPDATE SET
                 text = excluded.text,
                 status = {pending},
                 error_message = NULL,
                 attempts = 0,
                 processed_at = NULL",
            self.names.embed_queue,
            pending = QueueStatus::PENDING
        );
        sqlx::query(&sql)
            .bind(source_type)
            .bind(source_id)
            .bind(text)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Oldest pending items first, up to `limit`.
    pub async fn dequeue_pending(&self, limit: i64) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT id, source_type, source_id, text, status, error_message, attempts, created_at, processed_at
             FROM {} WHERE status = {} ORDER BY created_at ASC, id ASC LIMIT ?",
            self.names.embed_queue,
            QueueStatus::PENDING
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(queue_item_from_row).collect())
    }

    pub async fn get_queue_item(
        &self,
        source_type: &str,
        source_id: SourceId,
    ) -> Result<Option<QueueItem>> {
        let sql = format!(
            "SELECT id, source_type, source_id, text, status, error_message, attempts, created_at, processed_at
             FROM {} WHERE source_type = ? AND source_id = ?",
            self.names.embed_queue
        );
        let row = sqlx::query(&sql)
            .bind(source_type)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(queue_item_from_row))
    }

    pub async fn mark_queue_success(&self, id: i64, attempts: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = {}, attempts = ?, error_message = NULL, processed_at = ? WHERE id = ?",
            self.names.embed_queue,
            QueueStatus::SUCCESS
        );
        sqlx::query(&sql)
            .bind(attempts)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt. A terminal failure stores the attempt
    /// count as the (positive) status and stamps `processed_at`; a
    /// retryable one leaves the row pending.
    pub async fn mark_queue_failure(
        &self,
        id: i64,
        attempts: i64,
        message: &str,
        terminal: bool,
    ) -> Result<()> {
        if terminal {
            let sql = format!(
                "UPDATE {} SET status = ?, attempts = ?, error_message = ?, processed_at = ? WHERE id = ?",
                self.names.embed_queue
            );
            sqlx::query(&sql)
                .bind(attempts.max(1))
                .bind(attempts)
                .bind(message)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            let sql = format!(
                "UPDATE {} SET status = {}, attempts = ?, error_message = ? WHERE id = ?",
                self.names.embed_queue,
                QueueStatus::PENDING
            );
            sqlx::query(&sql)
                .bind(attempts)
                .bind(message)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let sql = format!(
            "SELECT
                 COALESCE(SUM(status = {p}), 0) AS pending,
                 COALESCE(SUM(status = {s}), 0) AS succeeded,
                 COALESCE(SUM(status > {s}), 0) AS failed
             FROM {}",
            self.names.embed_queue,
            p = QueueStatus::PENDING,
            s = QueueStatus::SUCCESS
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending: row.get("pending"),
            succeeded: row.get("succeeded"),
            failed: row.get("failed"),
        })
    }

    /// Terminally failed items, oldest first.
    pub async fn failed_items(&self) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT id, source_type, source_id, text, status, error_message, attempts, created_at, processed_at
             FROM {} WHERE status > {} ORDER BY created_at ASC",
            self.names.embed_queue,
            QueueStatus::SUCCESS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(queue_item_from_row).collect())
    }

    pub async fn clear_pending(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE status = {}",
            self.names.embed_queue,
            QueueStatus::PENDING
        );
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }

    pub async fn clear_failed(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE status > {}",
            self.names.embed_queue,
            QueueStatus::SUCCESS
        );
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }
}

/// Drop projection, embedding, and text rows for every candidate hash no
/// longer referenced by any chunk. Runs inside the caller's transaction.
async fn collect_orphans(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    names: &TableNames,
    candidates: &[ContentHash],
) -> Result<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "SELECT DISTINCT hash FROM {} WHERE hash IN ({})",
        names.chunks,
        placeholders(candidates.len())
    );
    let mut query = sqlx::query(&sql);
    for hash in candidates {
        query = query.bind(hash.to_vec());
    }
    let rows = query.fetch_all(&mut **tx).await?;
    let still_referenced: HashSet<ContentHash> = rows
        .into_iter()
        .map(|r| decode_hash(r.get("hash")))
        .collect::<Result<_>>()?;

    let orphans: Vec<ContentHash> = candidates
        .iter()
        .filter(|h| !still_referenced.contains(*h))
        .copied()
        .collect();
    if orphans.is_empty() {
        return Ok(());
    }

    let mut targets: Vec<String> = vec![names.projections.clone(), names.embeddings.clone()];
    if let (Some(texts), Some(fts)) = (&names.texts, &names.texts_fts) {
        targets.push(texts.clone());
        targets.push(fts.clone());
    }
    for table in targets {
        let sql = format!(
            "DELETE FROM {} WHERE hash IN ({})",
            table,
            placeholders(orphans.len())
        );
        let mut query = sqlx::query(&sql);
        for hash in &orphans {
            query = query.bind(hash.to_vec());
        }
        query.execute(&mut **tx).await?;
    }
    Ok(())
}

fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn service_from_row(row: &sqlx::sqlite::SqliteRow) -> EmbeddingService {
    EmbeddingService {
        id: row.get("id"),
        name: row.get("name"),
        format: row.get("format"),
        base_url: row.get("base_url"),
        model: row.get("model"),
        dimensions: row.get("dimensions"),
        max_tokens: row.get("max_tokens"),
        created_at: row.get("created_at"),
    }
}

fn queue_item_from_row(row: &sqlx::sqlite::SqliteRow) -> QueueItem {
    QueueItem {
        id: row.get("id"),
        source_type: row.get("source_type"),
        source_id: row.get("source_id"),
        text: row.get("text"),
        status: QueueStatus::from_code(row.get("status")),
        error_message: row.get("error_message"),
        attempts: row.get("attempts"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    }
}

pub(crate) fn decode_hash(bytes: Vec<u8>) -> Result<ContentHash> {
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Validation("stored content hash is not 32 bytes".into()))
}

pub(crate) fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get("id"),
        hash: decode_hash(row.get("hash"))?,
        source_type: row.get("source_type"),
        source_id: row.get("source_id"),
        pair_id: row.get("pair_id"),
        parent_id: row.get("parent_id"),
        offset: row.get("offset"),
        size: row.get("size"),
        match_count: row.get("match_count"),
        read_count: row.get("read_count"),
        created_at: row.get("created_at"),
    })
}
