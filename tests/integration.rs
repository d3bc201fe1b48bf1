use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use memodb::{
    EmbeddingBatch, EmbeddingProvider, Error, ProviderRegistry, QueueStatus, SearchParams,
    Service, ServiceConfig,
};

fn mock_config(dir: &TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::new(dir.path());
    config.format = Some("mock".into());
    config.model = Some("test".into());
    config.dimensions = Some(8);
    config.max_tokens = Some(100);
    config
}

async fn bind_mock(dir: &TempDir) -> Service {
    Service::bind(mock_config(dir)).await.unwrap()
}

fn loose_search(limit: i64) -> SearchParams {
    SearchParams {
        limit,
        min_score: 0.0,
        ..Default::default()
    }
}

/// Provider that fails every call; drives the retry-terminal scenarios.
struct FailingProvider;

#[async_trait]
impl EmbeddingProvider for FailingProvider {
    fn dimensions(&self) -> usize {
        8
    }

    async fn embed_texts(&self, _texts: &[String]) -> memodb::Result<EmbeddingBatch> {
        Err(Error::Provider("synthetic outage".into()))
    }
}

async fn bind_failing(dir: &TempDir) -> Service {
    let mut registry = ProviderRegistry::with_builtins();
    registry.register("failing", |_spec| Ok(Arc::new(FailingProvider)));
    let mut config = mock_config(dir);
    config.format = Some("failing".into());
    Service::bind_with_registry(config, &registry).await.unwrap()
}

#[tokio::test]
async fn basic_index_and_search() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service
        .index("event", 1, "The quick brown fox", None, None)
        .await
        .unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.sources, 1);

    let results = service.search("fox", &loose_search(5)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_type, "event");
    assert_eq!(results[0].chunk.source_id, 1);
    service.close().await;
}

#[tokio::test]
async fn identical_content_deduplicates() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "Shared text", None, None).await.unwrap();
    service.index("event", 2, "Shared text", None, None).await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 2);
    assert_eq!(stats.sources, 2);
    service.close().await;
}

#[tokio::test]
async fn reindexing_same_source_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "stable content", None, None).await.unwrap();
    service.index("event", 1, "stable content", None, None).await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 1);
    service.close().await;
}

#[tokio::test]
async fn source_type_filter_restricts_results() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "Event document", None, None).await.unwrap();
    service.index("idea", 2, "Idea document", None, None).await.unwrap();

    let params = SearchParams {
        source_type: Some("event".into()),
        ..loose_search(10)
    };
    let results = service.search("document", &params).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_type, "event");
    assert_eq!(results[0].chunk.source_id, 1);
    service.close().await;
}

#[tokio::test]
async fn pair_and_parent_relations_survive_the_queue() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service
        .index("event", 1, "Related document", Some(41), Some(99))
        .await
        .unwrap();

    let results = service.search("related", &loose_search(5)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.pair_id, Some(41));
    assert_eq!(results[0].chunk.parent_id, Some(99));

    let params = SearchParams {
        pair_id: Some(41),
        ..loose_search(5)
    };
    assert_eq!(service.search("related", &params).await.unwrap().len(), 1);

    let params = SearchParams {
        pair_id: Some(42),
        ..loose_search(5)
    };
    assert!(service.search("related", &params).await.unwrap().is_empty());
    service.close().await;
}

#[tokio::test]
async fn services_are_isolated() {
    let dir = TempDir::new().unwrap();

    let s1 = bind_mock(&dir).await;
    let mut config2 = mock_config(&dir);
    config2.model = Some("other".into());
    let s2 = Service::bind(config2).await.unwrap();

    s1.index("event", 1, "first space text", None, None).await.unwrap();
    s2.index("event", 2, "second space text", None, None).await.unwrap();

    let results = s1.search("text", &loose_search(10)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 1);

    let results = s2.search("text", &loose_search(10)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 2);

    s1.close().await;
    s2.close().await;
}

#[tokio::test]
async fn same_hash_under_second_service_is_rejected() {
    let dir = TempDir::new().unwrap();

    let s1 = bind_mock(&dir).await;
    let mut config2 = mock_config(&dir);
    config2.model = Some("other".into());
    let s2 = Service::bind(config2).await.unwrap();

    s1.index("event", 1, "contested content", None, None).await.unwrap();
    let err = s2
        .index("event", 2, "contested content", None, None)
        .await
        .unwrap_err();
    match err {
        Error::QueueItemFailed { message, .. } => {
            assert!(message.contains("different embedding service"));
        }
        other => panic!("expected QueueItemFailed, got {other:?}"),
    }

    s1.close().await;
    s2.close().await;
}

#[tokio::test]
async fn failing_provider_goes_terminal_after_retries() {
    let dir = TempDir::new().unwrap();
    let service = bind_failing(&dir).await;

    service.enqueue("a", 1, "x", None, None).await.unwrap();
    let outcome = service.process_queue().await.unwrap();
    assert_eq!(outcome.succeeded, 0);
    assert_eq!(outcome.failed, 1);

    let failed = service.failed_items().await.unwrap();
    assert_eq!(failed.len(), 1);
    let item = &failed[0];
    assert_eq!(item.attempts, 3);
    assert!(matches!(item.status, QueueStatus::Failed(n) if n >= 1));
    assert!(item.error_message.as_deref().unwrap().contains("synthetic outage"));
    assert!(item.processed_at.is_some());
    service.close().await;
}

#[tokio::test]
async fn index_surfaces_terminal_failure() {
    let dir = TempDir::new().unwrap();
    let service = bind_failing(&dir).await;

    let err = service.index("a", 1, "x", None, None).await.unwrap_err();
    match err {
        Error::QueueItemFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected QueueItemFailed, got {other:?}"),
    }
    service.close().await;
}

#[tokio::test]
async fn re_enqueue_resets_failed_item() {
    let dir = TempDir::new().unwrap();
    let service = bind_failing(&dir).await;

    service.enqueue("a", 1, "x", None, None).await.unwrap();
    service.process_queue().await.unwrap();
    assert_eq!(service.queue_stats().await.unwrap().failed, 1);

    service.enqueue("a", 1, "fresh text", None, None).await.unwrap();
    let stats = service.queue_stats().await.unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 1);
    assert!(service.failed_items().await.unwrap().is_empty());
    service.close().await;
}

#[tokio::test]
async fn delete_garbage_collects_orphans() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("a", 1, "unique", None, None).await.unwrap();
    assert_eq!(service.stats().await.unwrap().embeddings, 1);

    let deleted = service.delete(1, None).await.unwrap();
    assert_eq!(deleted, 1);
    let stats = service.stats().await.unwrap();
    assert_eq!(stats.embeddings, 0);
    assert_eq!(stats.chunks, 0);
    service.close().await;
}

#[tokio::test]
async fn delete_spares_still_referenced_hashes() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("a", 1, "shared body", None, None).await.unwrap();
    service.index("a", 2, "shared body", None, None).await.unwrap();

    service.delete(1, None).await.unwrap();
    let stats = service.stats().await.unwrap();
    assert_eq!(stats.embeddings, 1);
    assert_eq!(stats.chunks, 1);

    service.delete(2, None).await.unwrap();
    assert_eq!(service.stats().await.unwrap().embeddings, 0);
    service.close().await;
}

#[tokio::test]
async fn tight_projection_threshold_keeps_exact_match() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service
        .index("event", 1, "projection probe text", None, None)
        .await
        .unwrap();

    // Query identical to the stored content: self-distance is zero, so
    // even a near-zero threshold must admit it.
    let params = SearchParams {
        projection_threshold: Some(1e-9),
        ..loose_search(5)
    };
    let results = service
        .search("projection probe text", &params)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].score > 0.999);
    service.close().await;
}

#[tokio::test]
async fn non_positive_projection_threshold_is_rejected() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "threshold probe", None, None).await.unwrap();

    for bad in [0.0, -1.0] {
        let params = SearchParams {
            projection_threshold: Some(bad),
            ..loose_search(5)
        };
        assert!(matches!(
            service.search("probe", &params).await,
            Err(Error::Validation(_))
        ));
    }
    service.close().await;
}

#[tokio::test]
async fn match_count_grows_once_per_search() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "counted content", None, None).await.unwrap();

    let first = service.search("counted", &loose_search(5)).await.unwrap();
    assert_eq!(first[0].chunk.match_count, 0);

    let second = service.search("counted", &loose_search(5)).await.unwrap();
    assert_eq!(second[0].chunk.match_count, 1);

    let third = service.search("counted", &loose_search(5)).await.unwrap();
    assert_eq!(third[0].chunk.match_count, 2);
    service.close().await;
}

#[tokio::test]
async fn mark_as_read_increments_counter() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "read me", None, None).await.unwrap();
    let results = service.search("read", &loose_search(5)).await.unwrap();
    service.mark_as_read(&[results[0].chunk.id]).await.unwrap();

    let again = service.search("read", &loose_search(5)).await.unwrap();
    assert_eq!(again[0].chunk.read_count, 1);

    // Empty input is a no-op, not an error.
    service.mark_as_read(&[]).await.unwrap();
    service.close().await;
}

#[tokio::test]
async fn like_and_fts_filters() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service
        .index("event", 1, "The quick brown fox jumps", None, None)
        .await
        .unwrap();
    service
        .index("event", 2, "A slow green turtle crawls", None, None)
        .await
        .unwrap();

    let params = SearchParams {
        like: vec!["%quick%".into()],
        ..loose_search(10)
    };
    let results = service.search("animal", &params).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 1);

    let params = SearchParams {
        match_query: Some("turtle".into()),
        ..loose_search(10)
    };
    let results = service.search("animal", &params).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 2);

    let params = SearchParams {
        like: vec!["%zebra%".into()],
        ..loose_search(10)
    };
    assert!(service.search("animal", &params).await.unwrap().is_empty());
    service.close().await;
}

#[tokio::test]
async fn include_text_returns_stored_content() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "visible content", None, None).await.unwrap();

    let params = SearchParams {
        include_text: true,
        ..loose_search(5)
    };
    let results = service.search("visible", &params).await.unwrap();
    assert_eq!(results[0].text.as_deref(), Some("visible content"));

    let fetched = service.get_text(&results[0].chunk.hash).await.unwrap();
    assert_eq!(fetched.as_deref(), Some("visible content"));
    service.close().await;
}

#[tokio::test]
async fn text_filters_require_text_storage() {
    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&dir);
    config.store_text = false;
    let service = Service::bind(config).await.unwrap();

    service.index("event", 1, "no text store", None, None).await.unwrap();

    let params = SearchParams {
        include_text: true,
        ..loose_search(5)
    };
    assert!(matches!(
        service.search("anything", &params).await,
        Err(Error::Validation(_))
    ));

    // Plain search still works without text storage.
    let results = service.search("text", &loose_search(5)).await.unwrap();
    assert_eq!(results.len(), 1);
    service.close().await;
}

#[tokio::test]
async fn sql_where_joins_attached_database() {
    let dir = TempDir::new().unwrap();
    let app_db = dir.path().join("app.db");

    // Seed the application database the fragment will join against.
    {
        let url = format!("sqlite:{}?mode=rwc", app_db.display());
        let pool = sqlx::sqlite::SqlitePool::connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, starred INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO items (id, starred) VALUES (1, 1), (2, 0)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    let mut config = mock_config(&dir);
    config.attach.insert("app".into(), app_db);
    let service = Service::bind(config).await.unwrap();

    service.index("event", 1, "starred document", None, None).await.unwrap();
    service.index("event", 2, "plain document", None, None).await.unwrap();

    let params = SearchParams {
        sql_where: Some(
            "c.source_id IN (SELECT id FROM app.items WHERE starred = 1)".into(),
        ),
        ..loose_search(10)
    };
    let results = service.search("document", &params).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 1);
    service.close().await;
}

#[tokio::test]
async fn reindex_from_stored_text() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "first body", Some(5), None).await.unwrap();
    service.index("event", 2, "second body", None, None).await.unwrap();
    service.index("idea", 3, "untouched", None, None).await.unwrap();

    let re_enqueued = service.reindex("event", None).await.unwrap();
    assert_eq!(re_enqueued, 2);

    // Chunks for the type are gone until the queue is processed again.
    let stats = service.stats().await.unwrap();
    assert_eq!(stats.sources, 1);
    assert_eq!(service.queue_stats().await.unwrap().pending, 2);

    service.process_queue().await.unwrap();
    let stats = service.stats().await.unwrap();
    assert_eq!(stats.sources, 3);

    // Relation metadata made the round trip.
    let params = SearchParams {
        pair_id: Some(5),
        ..loose_search(10)
    };
    let results = service.search("first", &params).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.source_id, 1);
    service.close().await;
}

#[tokio::test]
async fn reindex_with_lookup_when_text_storage_is_off() {
    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&dir);
    config.store_text = false;
    let service = Service::bind(config).await.unwrap();

    service.index("event", 7, "lookup body", None, None).await.unwrap();

    let lookup = |source_id: i64| -> Option<String> {
        (source_id == 7).then(|| "lookup body".to_string())
    };
    let re_enqueued = service.reindex("event", Some(&lookup)).await.unwrap();
    assert_eq!(re_enqueued, 1);

    service.process_queue().await.unwrap();
    assert_eq!(service.stats().await.unwrap().sources, 1);
    service.close().await;
}

#[tokio::test]
async fn background_processing_drains_before_close() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    for i in 0..3 {
        service
            .enqueue("event", i, &format!("background doc {i}"), None, None)
            .await
            .unwrap();
    }
    service.process_queue_in_background().await;
    service.close().await;

    let service = bind_mock(&dir).await;
    let stats = service.stats().await.unwrap();
    assert_eq!(stats.sources, 3);
    assert_eq!(service.queue_stats().await.unwrap().pending, 0);
    service.close().await;
}

#[tokio::test]
async fn chunked_document_keeps_offsets_and_order() {
    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&dir);
    // Force chunking: everything estimates above the no-chunk threshold.
    config.no_chunk_threshold = 1;
    config.chunking_min_tokens = 0;
    config.chunking_max_tokens = 100;
    let service = Service::bind(config).await.unwrap();

    let text = "First paragraph of the document.\n\nSecond paragraph follows.\n\nThird closes it.";
    service.index("doc", 1, text, None, None).await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.sources, 1);

    let results = service.search("paragraph", &loose_search(10)).await.unwrap();
    assert_eq!(results.len(), 3);
    let mut offsets: Vec<i64> = results.iter().map(|m| m.chunk.offset.unwrap()).collect();
    offsets.sort_unstable();
    assert_eq!(offsets[0], 0);
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    service.close().await;
}

#[tokio::test]
async fn unknown_service_name_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let mut config = ServiceConfig::new(dir.path());
    config.service = Some("never-registered".into());
    assert!(matches!(
        Service::bind(config).await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn chunking_bound_is_validated_against_service() {
    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&dir);
    config.chunking_max_tokens = 101; // service max_tokens is 100
    assert!(matches!(
        Service::bind(config).await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn openai_without_api_key_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&dir);
    config.format = Some("openai".into());
    config.api_key = None;
    assert!(matches!(
        Service::bind(config).await,
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn delete_service_requires_force_while_populated() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    service.index("event", 1, "owned data", None, None).await.unwrap();

    let name = service.service().name.clone();
    match service.delete_service(&name, false).await {
        Err(Error::ServiceInUse { embeddings, chunks }) => {
            assert_eq!(embeddings, 1);
            assert_eq!(chunks, 1);
        }
        other => panic!("expected ServiceInUse, got {other:?}"),
    }

    service.delete_service(&name, true).await.unwrap();
    assert_eq!(service.stats().await.unwrap().embeddings, 0);
    assert!(service.list_services().await.unwrap().is_empty());
    service.close().await;
}

#[tokio::test]
async fn table_prefix_isolates_instances() {
    let dir = TempDir::new().unwrap();

    let mut config_a = mock_config(&dir);
    config_a.table_prefix = "a_".into();
    let a = Service::bind(config_a).await.unwrap();

    let mut config_b = mock_config(&dir);
    config_b.table_prefix = "b_".into();
    let b = Service::bind(config_b).await.unwrap();

    a.index("event", 1, "instance a data", None, None).await.unwrap();

    assert_eq!(a.stats().await.unwrap().chunks, 1);
    assert_eq!(b.stats().await.unwrap().chunks, 0);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn limit_bounds_and_orders_results() {
    let dir = TempDir::new().unwrap();
    let service = bind_mock(&dir).await;

    for i in 0..10 {
        service
            .index("event", i, &format!("document number {i}"), None, None)
            .await
            .unwrap();
    }

    let results = service.search("document", &loose_search(4)).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    service.close().await;
}
