//! Durable ingestion queue and retry policy.
//!
//! The queue is the sole authority for ingestion state: `index` is
//! "enqueue, then process that item", and batch processing drains pending
//! rows oldest-first. Each item is embedded and stored at most once
//! successfully; failures increment an attempt counter until the item
//! goes terminal at `max_retries`.
//!
//! Relation metadata (`pair_id`, `parent_id`) rides inside the queued
//! text as a one-line prefix so the queue schema stays a plain
//! `(source_type, source_id, text)` upsert:
//!
//! ```text
//! MEMO_META:{pair_id_or_empty},{parent_id_or_empty}\n{payload}
//! ```
//!
//! The provider call always happens before the write transaction opens —
//! the database write lock is never held across HTTP.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunk::{split_text, ChunkingConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{ContentHash, QueueItem, QueueStatus, SourceId};
use crate::projection::ProjectionMatrix;
use crate::store::{content_hash, ChunkInsert, NewEmbedding, Store};

/// Literal line prefix carrying relation metadata through the queue.
pub const META_PREFIX: &str = "MEMO_META:";

/// Prefix `text` with the relation metadata line when either relation is
/// present; otherwise the text passes through untouched.
pub fn encode_meta(text: &str, pair_id: Option<i64>, parent_id: Option<i64>) -> String {
    if pair_id.is_none() && parent_id.is_none() {
        return text.to_string();
    }
    let pair = pair_id.map(|v| v.to_string()).unwrap_or_default();
    let parent = parent_id.map(|v| v.to_string()).unwrap_or_default();
    format!("{}{},{}\n{}", META_PREFIX, pair, parent, text)
}

/// Strip the metadata prefix back out. A missing or malformed prefix
/// means both relations are absent and the text is the whole payload.
pub fn split_meta(stored: &str) -> (Option<i64>, Option<i64>, &str) {
    if let Some(rest) = stored.strip_prefix(META_PREFIX) {
        if let Some((header, payload)) = rest.split_once('\n') {
            if let Some((pair, parent)) = header.split_once(',') {
                return (pair.parse().ok(), parent.parse().ok(), payload);
            }
        }
    }
    (None, None, stored)
}

/// Counts from one `process_queue` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub succeeded: u64,
    pub failed: u64,
}

/// What one recorded attempt left behind on the queue row.
enum AttemptOutcome {
    Succeeded,
    /// The failure was recorded and the row is still pending; its attempt
    /// counter advanced, so retry loops stay bounded.
    Retrying,
    /// The row went terminal; carries the error to surface to callers.
    Terminal(Error),
}

/// Drives queue items through chunk → embed → store. Cheap to clone;
/// background processing clones one into a detached task.
#[derive(Clone)]
pub(crate) struct QueueProcessor {
    store: Store,
    provider: Arc<dyn EmbeddingProvider>,
    projection: Arc<ProjectionMatrix>,
    chunking: ChunkingConfig,
    service_id: i64,
    store_text: bool,
    batch_size: i64,
    max_retries: i64,
}

impl QueueProcessor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Store,
        provider: Arc<dyn EmbeddingProvider>,
        projection: Arc<ProjectionMatrix>,
        chunking: ChunkingConfig,
        service_id: i64,
        store_text: bool,
        batch_size: i64,
        max_retries: i64,
    ) -> Self {
        Self {
            store,
            provider,
            projection,
            chunking,
            service_id,
            store_text,
            batch_size,
            max_retries,
        }
    }

    /// Upsert a pending item, packing relations into the text field.
    pub(crate) async fn enqueue(
        &self,
        source_type: &str,
        source_id: SourceId,
        text: &str,
        pair_id: Option<i64>,
        parent_id: Option<i64>,
    ) -> Result<()> {
        let payload = encode_meta(text, pair_id, parent_id);
        self.store
            .enqueue_item(source_type, source_id, &payload)
            .await
    }

    /// Drain pending items in batches until a select comes back empty.
    ///
    /// Item failures are recorded on their rows and never abort the pass;
    /// only queue-level database errors (the dequeue itself, or the write
    /// recording an attempt) propagate.
    pub(crate) async fn process_queue(&self) -> Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();
        loop {
            let batch = self.store.dequeue_pending(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            for item in batch {
                match self.run_attempt(&item).await? {
                    AttemptOutcome::Succeeded => outcome.succeeded += 1,
                    AttemptOutcome::Terminal(_) => outcome.failed += 1,
                    // Still pending; a later select of this pass retries it.
                    AttemptOutcome::Retrying => {}
                }
            }
        }
        info!(
            target: "memodb::queue",
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "queue drained"
        );
        Ok(outcome)
    }

    /// Process one `(source_type, source_id)` synchronously, retrying up
    /// to `max_retries` within this call. Exhausting the retries marks the
    /// row terminal and surfaces [`Error::QueueItemFailed`] to the caller.
    pub(crate) async fn process_queue_item(
        &self,
        source_type: &str,
        source_id: SourceId,
    ) -> Result<()> {
        loop {
            let item = self
                .store
                .get_queue_item(source_type, source_id)
                .await?
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "no queue item for {}/{}",
                        source_type, source_id
                    ))
                })?;

            match item.status {
                QueueStatus::Success => return Ok(()),
                QueueStatus::Failed(_) => {
                    return Err(Error::QueueItemFailed {
                        source_type: item.source_type,
                        source_id: item.source_id,
                        attempts: item.attempts,
                        message: item.error_message.unwrap_or_default(),
                    });
                }
                QueueStatus::Pending => {}
            }

            // A bookkeeping failure propagates via `?`: the row's attempt
            // counter did not advance, so looping on it would be unbounded.
            match self.run_attempt(&item).await? {
                AttemptOutcome::Succeeded => return Ok(()),
                AttemptOutcome::Terminal(failure) => return Err(failure),
                AttemptOutcome::Retrying => {}
            }
        }
    }

    /// One attempt against one item, with the status transition recorded
    /// on the row before this returns. `Err` here means the transition
    /// itself could not be written — an attempt that merely failed comes
    /// back as `Ok(Retrying)` or `Ok(Terminal(..))`.
    async fn run_attempt(&self, item: &QueueItem) -> Result<AttemptOutcome> {
        let attempts = item.attempts + 1;
        match self.embed_and_store(item).await {
            Ok(()) => {
                self.store.mark_queue_success(item.id, attempts).await?;
                debug!(
                    target: "memodb::queue",
                    source_type = %item.source_type,
                    source_id = item.source_id,
                    "indexed"
                );
                Ok(AttemptOutcome::Succeeded)
            }
            Err(e) => {
                let message = e.to_string();
                // An item never goes terminal before the retry budget is
                // spent, whatever the failure class.
                let terminal = attempts >= self.max_retries;
                self.store
                    .mark_queue_failure(item.id, attempts, &message, terminal)
                    .await?;
                warn!(
                    target: "memodb::queue",
                    source_type = %item.source_type,
                    source_id = item.source_id,
                    attempts,
                    terminal,
                    error = %message,
                    "attempt failed"
                );
                if terminal {
                    Ok(AttemptOutcome::Terminal(Error::QueueItemFailed {
                        source_type: item.source_type.clone(),
                        source_id: item.source_id,
                        attempts,
                        message,
                    }))
                } else {
                    Ok(AttemptOutcome::Retrying)
                }
            }
        }
    }

    /// Chunk, embed, and persist one document.
    ///
    /// The provider is called for missing hashes only, before any write
    /// transaction opens; the storage itself (chunk replacement,
    /// embeddings, projections, texts) is a single transaction in
    /// [`Store::store_document`].
    async fn embed_and_store(&self, item: &QueueItem) -> Result<()> {
        let (pair_id, parent_id, payload) = split_meta(&item.text);
        let pieces = split_text(payload, &self.chunking);

        let mut chunks: Vec<ChunkInsert> = Vec::with_capacity(pieces.len());
        let mut offset: i64 = 0;
        for piece in pieces {
            let size = piece.chars().count() as i64;
            chunks.push(ChunkInsert {
                hash: content_hash(&piece),
                text: piece,
                offset,
                size,
            });
            offset += size;
        }

        // Dedup within the document, first occurrence wins.
        let mut unique: Vec<(ContentHash, String)> = Vec::new();
        for chunk in &chunks {
            if !unique.iter().any(|(h, _)| h == &chunk.hash) {
                unique.push((chunk.hash, chunk.text.clone()));
            }
        }

        let existing = self
            .store
            .embedding_services_for(&unique.iter().map(|(h, _)| *h).collect::<Vec<_>>())
            .await?;
        for owner in existing.values() {
            if *owner != self.service_id {
                return Err(Error::ServiceMismatch);
            }
        }

        let missing: Vec<(ContentHash, String)> = unique
            .into_iter()
            .filter(|(h, _)| !existing.contains_key(h))
            .collect();

        let mut new_embeddings: Vec<NewEmbedding> = Vec::with_capacity(missing.len());
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let batch = self.provider.embed_texts(&texts).await?;
            if batch.vectors.len() != missing.len() {
                return Err(Error::Provider(format!(
                    "provider returned {} vectors for {} inputs",
                    batch.vectors.len(),
                    missing.len()
                )));
            }

            for (i, (hash, _)) in missing.into_iter().enumerate() {
                let vector = batch.vectors[i].clone();
                let projection = self.projection.project(&vector)?;
                new_embeddings.push(NewEmbedding {
                    hash,
                    vector,
                    token_count: batch.token_counts.get(i).copied().unwrap_or(0),
                    projection,
                });
            }
        }

        self.store
            .store_document(
                self.service_id,
                &item.source_type,
                item.source_id,
                pair_id,
                parent_id,
                &chunks,
                &new_embeddings,
                self.store_text,
            )
            .await
    }

    /// Start a detached drain of the queue and return immediately.
    ///
    /// The task runs to natural completion (queue empty) and cannot be
    /// cancelled; it offers no completion signal or error surface, so
    /// callers needing either should use [`process_queue`] directly. The
    /// owning `Service` awaits the handle on close.
    ///
    /// [`process_queue`]: Self::process_queue
    pub(crate) fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = processor.process_queue().await {
                warn!(target: "memodb::queue", error = %e, "background processing aborted");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip_both_relations() {
        let encoded = encode_meta("payload text", Some(7), Some(9));
        assert_eq!(encoded, "MEMO_META:7,9\npayload text");
        assert_eq!(split_meta(&encoded), (Some(7), Some(9), "payload text"));
    }

    #[test]
    fn meta_roundtrip_partial_relations() {
        let encoded = encode_meta("x", Some(3), None);
        assert_eq!(encoded, "MEMO_META:3,\nx");
        assert_eq!(split_meta(&encoded), (Some(3), None, "x"));

        let encoded = encode_meta("x", None, Some(11));
        assert_eq!(encoded, "MEMO_META:,11\nx");
        assert_eq!(split_meta(&encoded), (None, Some(11), "x"));
    }

    #[test]
    fn no_relations_means_no_prefix() {
        let encoded = encode_meta("plain text\nwith lines", None, None);
        assert_eq!(encoded, "plain text\nwith lines");
        assert_eq!(
            split_meta(&encoded),
            (None, None, "plain text\nwith lines")
        );
    }

    #[test]
    fn malformed_prefix_passes_through() {
        let text = "MEMO_META:not-a-header-without-newline";
        assert_eq!(split_meta(text), (None, None, text));
    }
}
