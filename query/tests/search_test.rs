use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ingestion::{EmbedService, HashingTextEmbedder, IngestionPipeline, Parser, TextEmbedder};
use media::{HashingImageEmbedder, ImageEmbedder, InMemoryBlobStore, MediaLibrary, MockVisionService, UploadOptions};
use notemesh_core::cache::{CacheConfig, SharedCache};
use notemesh_core::config::{IngestionConfig, RetrievalConfig};
use notemesh_core::error::{GatewayError, GatewayResult};
use notemesh_core::metrics::MetricsCollector;
use notemesh_core::model::BlockKind;
use query::{
    HybridQuery, ImageSimilarityQuery, ImageSource, RetrievalEngine, SemanticQuery, TagQuery,
};
use storage::{ChunkStore, InMemoryVectorIndex, TagLogic};

const NOTE_A: &str = "---\ntitle: Note A\ntags: [alpha, beta]\n---\n# Heading\nPara one mentions PostgreSQL.\n- bullet\n";

struct Harness {
    store: Arc<ChunkStore>,
    pipeline: IngestionPipeline,
    worker: ingestion::EmbedWorker,
    engine: RetrievalEngine,
    library: Arc<MediaLibrary>,
    metrics: MetricsCollector,
}

fn harness_with_embedder(embedder: Arc<dyn TextEmbedder>) -> Harness {
    let store = Arc::new(ChunkStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let image_vectors = Arc::new(InMemoryVectorIndex::new());
    let image_embedder: Arc<dyn ImageEmbedder> = Arc::new(HashingImageEmbedder::default());
    let metrics = MetricsCollector::default();

    let (embed, worker) = EmbedService::channel(
        store.clone(),
        vectors.clone(),
        Arc::new(HashingTextEmbedder::default()),
    );
    let pipeline = IngestionPipeline::new(
        store.clone(),
        vectors.clone(),
        embed,
        Parser::default(),
        IngestionConfig::default(),
    );

    let library = Arc::new(MediaLibrary::new(
        store.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(MockVisionService),
        Arc::new(HashingImageEmbedder::default()),
        image_vectors.clone(),
    ));

    let engine = RetrievalEngine::new(
        store.clone(),
        vectors,
        image_vectors,
        embedder,
        image_embedder,
        SharedCache::new("search", CacheConfig::default()),
        metrics.clone(),
        RetrievalConfig::default(),
    );

    Harness {
        store,
        pipeline,
        worker,
        engine,
        library,
        metrics,
    }
}

fn harness() -> Harness {
    harness_with_embedder(Arc::new(HashingTextEmbedder::default()))
}

struct FailingEmbedder;

#[async_trait]
impl TextEmbedder for FailingEmbedder {
    fn model_id(&self) -> &str {
        "text-embed-v1"
    }

    fn dimension(&self) -> usize {
        256
    }

    async fn embed_text(&self, _inputs: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        Err(GatewayError::network("CONN_REFUSED", "vector backend down"))
    }
}

#[tokio::test]
async fn semantic_search_returns_the_matching_paragraph_first() {
    let mut h = harness();
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    let page = h
        .engine
        .semantic(&SemanticQuery::new("PostgreSQL"))
        .await
        .unwrap();

    assert!(!page.items.is_empty());
    let top = &page.items[0];
    assert_eq!(top.chunk.metadata.block, Some(BlockKind::Paragraph));
    assert!(top.chunk.contents.contains("PostgreSQL"));
    assert!(top.score > 0.0);
    assert_eq!(top.chunk.position.as_ref().unwrap().line_start, 5);
}

#[tokio::test]
async fn semantic_search_filters_by_tags() {
    let mut h = harness();
    h.pipeline
        .ingest(
            "notes/tagged.md",
            "# H\nPara mentions PostgreSQL inline #alpha\n",
        )
        .await
        .unwrap();
    h.pipeline
        .ingest("notes/plain.md", "Another PostgreSQL mention.\n")
        .await
        .unwrap();
    h.worker.run_until_idle().await;

    let alpha = h
        .store
        .by_document("tag:alpha", None, 1)
        .await
        .unwrap()
        .chunks
        .into_iter()
        .next()
        .unwrap();

    let mut query = SemanticQuery::new("PostgreSQL");
    query.tags = vec![alpha.chunk_id];
    let page = h.engine.semantic(&query).await.unwrap();

    assert!(!page.items.is_empty());
    for hit in &page.items {
        assert_eq!(hit.chunk.document_id, "notes/tagged.md");
        assert!(hit.chunk.tags.contains(&alpha.chunk_id));
    }
}

#[tokio::test]
async fn tag_search_intersects_and_paginates() {
    let mut h = harness();
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    let page_chunk = h
        .store
        .by_document("notes/a.md", None, 10)
        .await
        .unwrap()
        .chunks
        .into_iter()
        .next()
        .unwrap();
    let tag_ids: Vec<_> = page_chunk.tags.iter().copied().collect();

    let result = h
        .engine
        .tag(&TagQuery::new(tag_ids, TagLogic::And))
        .await
        .unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].chunk.chunk_id, page_chunk.chunk_id);
    assert_eq!(result.total, Some(1));
}

#[tokio::test]
async fn hybrid_fuses_semantic_and_tag_scores() {
    let mut h = harness();
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    let page_chunk = h
        .store
        .by_document("notes/a.md", None, 10)
        .await
        .unwrap()
        .chunks
        .into_iter()
        .next()
        .unwrap();
    let tag_ids: Vec<_> = page_chunk.tags.iter().copied().collect();

    let mut query = HybridQuery::new("PostgreSQL", tag_ids);
    query.alpha = Some(0.7);
    let page = h.engine.hybrid(&query).await.unwrap();

    // The tagged page scores (1 - alpha); the matching paragraph scores
    // alpha * semantic. Both appear exactly once.
    let ids: Vec<_> = page.items.iter().map(|hit| hit.chunk.chunk_id).collect();
    let mut deduped = ids.clone();
    deduped.dedup();
    assert_eq!(ids, deduped, "fusion de-duplicates by chunk id");
    assert!(page
        .items
        .iter()
        .any(|hit| hit.chunk.chunk_id == page_chunk.chunk_id));
    assert!(page
        .items
        .iter()
        .any(|hit| hit.chunk.contents.contains("PostgreSQL")));
}

#[tokio::test]
async fn vector_outage_falls_back_to_fulltext() {
    let mut h = harness_with_embedder(Arc::new(FailingEmbedder));
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    let page = h
        .engine
        .semantic(&SemanticQuery::new("PostgreSQL"))
        .await
        .unwrap();
    assert!(!page.items.is_empty(), "fulltext fallback served the query");
    assert!(page.items[0].chunk.contents.contains("PostgreSQL"));
}

#[tokio::test]
async fn repeated_query_is_served_from_cache() {
    let mut h = harness();
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    let query = SemanticQuery::new("PostgreSQL");
    let first = h.engine.semantic(&query).await.unwrap();
    let second = h.engine.semantic(&query).await.unwrap();
    assert_eq!(first, second);

    h.engine.invalidate_search_cache();
    let third = h.engine.semantic(&query).await.unwrap();
    assert_eq!(first.items.len(), third.items.len());
}

#[tokio::test]
async fn image_similarity_finds_duplicates() {
    let h = harness();

    let original = h
        .library
        .upload(
            Bytes::from_static(b"pixel-data-1"),
            "image/png",
            &UploadOptions {
                analyze: false,
                embed: true,
                document_id: None,
            },
        )
        .await
        .unwrap();
    h.library
        .upload(
            Bytes::from_static(b"pixel-data-2"),
            "image/png",
            &UploadOptions {
                analyze: false,
                embed: true,
                document_id: None,
            },
        )
        .await
        .unwrap();

    // Duplicate query by bytes: the identical image scores 1.0.
    let duplicates = h
        .engine
        .duplicate_images(ImageSource::Bytes(Bytes::from_static(b"pixel-data-1")), 10)
        .await
        .unwrap();
    assert_eq!(duplicates.items.len(), 1);
    assert_eq!(duplicates.items[0].chunk.chunk_id, original.chunk_id);
    assert!(duplicates.items[0].score > 0.97);

    // By chunk id: the source itself is excluded.
    let by_chunk = h
        .engine
        .image_similarity(&ImageSimilarityQuery::for_chunk(original.chunk_id))
        .await
        .unwrap();
    assert!(by_chunk
        .items
        .iter()
        .all(|hit| hit.chunk.chunk_id != original.chunk_id));
}

#[tokio::test]
async fn slow_queries_are_recorded_with_redacted_payload() {
    let mut h = harness();
    h.pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    h.worker.run_until_idle().await;

    // Threshold zero: everything is slow.
    let config = RetrievalConfig {
        slow_query_threshold_ms: 0,
        slow_query_payload_cap: 8,
        ..RetrievalConfig::default()
    };
    let engine = RetrievalEngine::new(
        h.store.clone(),
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(HashingTextEmbedder::default()),
        Arc::new(HashingImageEmbedder::default()),
        SharedCache::new("search", CacheConfig::default()),
        h.metrics.clone(),
        config,
    );

    engine
        .fulltext(&query::FulltextQuery::new(
            "a very long query payload that should be capped",
        ))
        .await
        .unwrap();

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.slow_queries.len(), 1);
    let record = &snapshot.slow_queries[0];
    assert_eq!(record.kind, "fulltext");
    assert!(record.payload.contains("redacted"));
    assert!(record.payload.len() < 64);
}
