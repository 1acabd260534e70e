use std::sync::Arc;

use ingestion::{EmbedService, HashingTextEmbedder, IngestionPipeline, Parser};
use notemesh_core::config::IngestionConfig;
use notemesh_core::model::{normalize_whitespace, BlockKind};
use notemesh_core::op::OpPayload;
use storage::{render_document, ChunkStore, InMemoryVectorIndex, TagLogic};

const NOTE_A: &str = "---\ntitle: Note A\ntags: [alpha, beta]\n---\n# Heading\nPara one mentions PostgreSQL.\n- bullet\n";

fn build_pipeline() -> (
    Arc<ChunkStore>,
    Arc<InMemoryVectorIndex>,
    IngestionPipeline,
    ingestion::EmbedWorker,
) {
    let store = Arc::new(ChunkStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let embedder = Arc::new(HashingTextEmbedder::default());
    let (embed, worker) = EmbedService::channel(store.clone(), vectors.clone(), embedder);
    let pipeline = IngestionPipeline::new(
        store.clone(),
        vectors.clone(),
        embed,
        Parser::default(),
        IngestionConfig::default(),
    );
    (store, vectors, pipeline, worker)
}

#[tokio::test]
async fn ingest_builds_the_expected_forest() {
    let (store, _vectors, pipeline, _worker) = build_pipeline();

    let report = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    assert_eq!(report.created, 4, "page, heading, paragraph, bullet");
    assert_eq!(report.deleted, 0);

    let page = store.by_document("notes/a.md", None, 100).await.unwrap();
    assert_eq!(page.total, 4);

    let chunks = page.chunks;
    let page_chunk = &chunks[0];
    assert!(page_chunk.flags.is_page);
    assert_eq!(page_chunk.metadata.title.as_deref(), Some("Note A"));
    assert_eq!(page_chunk.tags.len(), 2, "alpha and beta attached to page");

    let heading = chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::Heading))
        .unwrap();
    let para = chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::Paragraph))
        .unwrap();
    let bullet = chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::ListItem))
        .unwrap();

    assert_eq!(heading.parent, Some(page_chunk.chunk_id));
    assert_eq!(para.parent, Some(heading.chunk_id));
    assert_eq!(bullet.parent, Some(heading.chunk_id));
    assert_eq!(para.page, Some(page_chunk.chunk_id));
    assert_eq!(bullet.page, Some(page_chunk.chunk_id));

    let position = para.position.as_ref().unwrap();
    assert_eq!(position.line_start, 5);

    // Tag chunks exist and the inverted index resolves them.
    let tag_ids: Vec<_> = page_chunk.tags.iter().copied().collect();
    let tagged = store
        .by_tags(&tag_ids, TagLogic::And, &storage::TagFilters::default())
        .await
        .unwrap();
    assert_eq!(tagged, vec![page_chunk.chunk_id]);

    assert!(store.check_invariants().await.is_empty());
}

#[tokio::test]
async fn reingest_of_unchanged_content_emits_zero_operations() {
    let (_store, _vectors, pipeline, _worker) = build_pipeline();

    let first = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    assert_eq!(first.ops.len(), 4);

    let second = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    assert!(second.ops.is_empty());
    assert_eq!(second.created, 0);
    assert_eq!(second.deleted, 0);
}

#[tokio::test]
async fn single_paragraph_edit_yields_exactly_one_update() {
    let (store, _vectors, pipeline, mut worker) = build_pipeline();

    let first = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    worker.run_until_idle().await;

    let before = store.by_document("notes/a.md", None, 100).await.unwrap();
    let para_before = before
        .chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::Paragraph))
        .unwrap()
        .clone();
    assert!(
        para_before.embedding_ref.is_some(),
        "first embed pass completed"
    );

    let edited = NOTE_A.replace("Para one", "Para ONE");
    let second = pipeline.ingest("notes/a.md", &edited).await.unwrap();

    assert_eq!(second.updated, 1, "exactly one update operation");
    assert_eq!(second.created, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.ops.len(), 1);
    assert!(matches!(second.ops[0].payload, OpPayload::Update { .. }));
    assert_eq!(second.embeds_requested, 1, "embedding re-requested");

    let after = store.by_document("notes/a.md", None, 100).await.unwrap();
    let para_after = after
        .chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::Paragraph))
        .unwrap();
    assert_eq!(
        para_after.chunk_id, para_before.chunk_id,
        "chunk id is preserved across the edit"
    );
    assert!(para_after.contents.contains("Para ONE"));
    assert!(
        para_after.embedding_ref.is_none(),
        "stale embedding handle invalidated until the new vector lands"
    );

    // The other chunks kept their ids and contents.
    for chunk in &after.chunks {
        if chunk.chunk_id == para_after.chunk_id {
            continue;
        }
        assert!(before.chunks.iter().any(|b| b.chunk_id == chunk.chunk_id));
    }
    assert_eq!(first.chunk_ids.len(), second.chunk_ids.len());
}

#[tokio::test]
async fn removed_bullet_is_deleted_and_new_bullet_created() {
    let (_store, _vectors, pipeline, _worker) = build_pipeline();

    pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    let edited = NOTE_A.replace("- bullet\n", "");
    let report = pipeline.ingest("notes/a.md", &edited).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.created, 0);

    let back = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    assert_eq!(back.created, 1, "tombstoned ids are not resurrected");
}

#[tokio::test]
async fn embed_worker_writes_vectors_and_handles() {
    let (store, vectors, pipeline, mut worker) = build_pipeline();

    let report = pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    assert_eq!(report.embeds_requested, 3, "heading, paragraph, bullet");
    worker.run_until_idle().await;

    assert_eq!(vectors.len().await, 3, "heading, paragraph, bullet");
    let doc = store.by_document("notes/a.md", None, 100).await.unwrap();
    let para = doc
        .chunks
        .iter()
        .find(|c| c.metadata.block == Some(BlockKind::Paragraph))
        .unwrap();
    let handle = para.embedding_ref.as_ref().unwrap();
    assert_eq!(handle.contents_hash, para.contents_hash());
    assert_eq!(handle.model_id, "text-embed-v1");
}

#[tokio::test]
async fn keyed_ingest_replays_the_prior_outcome() {
    let (_store, _vectors, pipeline, _worker) = build_pipeline();

    let first = pipeline
        .ingest_keyed("req-1", "notes/a.md", NOTE_A)
        .await
        .unwrap();
    assert_eq!(first.created, 4);

    // Same key: replay, even though the content would now diff to zero ops.
    let replay = pipeline
        .ingest_keyed("req-1", "notes/a.md", NOTE_A)
        .await
        .unwrap();
    assert_eq!(replay.created, 4);
    assert_eq!(replay.content_hash, first.content_hash);
}

#[tokio::test]
async fn document_renders_back_modulo_whitespace() {
    let (store, _vectors, pipeline, _worker) = build_pipeline();

    pipeline.ingest("notes/a.md", NOTE_A).await.unwrap();
    let doc = store.by_document("notes/a.md", None, 100).await.unwrap();
    let rendered = render_document(&doc.chunks);

    let body = NOTE_A.split("---\n").nth(2).unwrap();
    assert_eq!(
        normalize_whitespace(&rendered),
        normalize_whitespace(body),
        "reassembly reconstructs the body modulo whitespace"
    );
}
