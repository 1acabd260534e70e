use crate::api::{BatchItemStatus, ChunkPatch, ErrorEnvelope, MediaUploadResponse, MetricsResponse};
use crate::health::{HealthChecker, HealthReport};
use async_trait::async_trait;
use bytes::Bytes;
use ingestion::{EmbedJob, EmbedService, EmbedWorker, HashingTextEmbedder, IngestReport, IngestionPipeline, Parser, ParserConfig, TextEmbedder};
use media::{
    BatchProcessor, BatchProgress, BatchReport, BlobStore, HashingImageEmbedder, ImageEmbedder,
    InMemoryBlobStore, MediaLibrary, MediaListing, MockVisionService, UploadOptions, UploadTask,
    VisionService,
};
use notemesh_core::breaker::{CircuitBreaker, CircuitBreakerConfig};
use notemesh_core::cache::{CacheCoordinator, CacheConfig, SharedCache};
use notemesh_core::config::AppConfig;
use notemesh_core::error::{GatewayError, GatewayResult};
use notemesh_core::metrics::MetricsCollector;
use notemesh_core::model::{CascadeMode, Chunk, ChunkId, ImageAnalysis};
use notemesh_core::op::{OpBaseline, OpPayload, OpPriorities, SyncOp};
use notemesh_core::retry::{RetryPolicy, Retryer};
use query::{
    HybridQuery, ImageSimilarityQuery, ImageSource, RetrievalEngine, SearchPage, SemanticQuery,
    TagQuery,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{ChunkStore, DeleteOutcome, InMemoryVectorIndex, VectorIndex};
use sync::{
    ConnectivityMonitor, MockRemoteStore, RemoteStore, ResolutionStrategy, SyncConfig,
    SyncCoordinator, SyncStats,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External collaborators, injected by the composition root. Defaults are
/// the in-memory/deterministic implementations, so tests and offline runs
/// compose without network.
pub struct GatewayDeps {
    pub embedder: Arc<dyn TextEmbedder>,
    pub image_embedder: Arc<dyn ImageEmbedder>,
    pub vision: Arc<dyn VisionService>,
    pub blob: Arc<dyn BlobStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub image_vectors: Arc<dyn VectorIndex>,
}

impl GatewayDeps {
    pub fn in_memory() -> Self {
        Self {
            embedder: Arc::new(HashingTextEmbedder::default()),
            image_embedder: Arc::new(HashingImageEmbedder::default()),
            vision: Arc::new(MockVisionService),
            blob: Arc::new(InMemoryBlobStore::new()),
            remote: Arc::new(MockRemoteStore::new()),
            vectors: Arc::new(InMemoryVectorIndex::new()),
            image_vectors: Arc::new(InMemoryVectorIndex::new()),
        }
    }
}

/// Text-embedding seam wrapped in deadline, circuit breaker, and retry, in
/// that order: the breaker sees each attempt, the retryer sees the breaker's
/// verdicts.
struct ResilientTextEmbedder {
    inner: Arc<dyn TextEmbedder>,
    retryer: Retryer,
    breaker: CircuitBreaker,
    deadline: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl TextEmbedder for ResilientTextEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed_text(&self, inputs: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        let inputs = inputs.to_vec();
        self.retryer
            .execute(&self.cancel, |_| {
                let inputs = inputs.clone();
                async move {
                    self.breaker
                        .call(|| async {
                            match tokio::time::timeout(
                                self.deadline,
                                self.inner.embed_text(&inputs),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(GatewayError::timeout(
                                    "EMBED_DEADLINE",
                                    "text embedding deadline exceeded",
                                )),
                            }
                        })
                        .await
                }
            })
            .await
    }
}

struct ResilientImageEmbedder {
    inner: Arc<dyn ImageEmbedder>,
    retryer: Retryer,
    breaker: CircuitBreaker,
    deadline: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl ImageEmbedder for ResilientImageEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed_image(&self, bytes: &Bytes) -> GatewayResult<Vec<f32>> {
        let bytes = bytes.clone();
        self.retryer
            .execute(&self.cancel, |_| {
                let bytes = bytes.clone();
                async move {
                    self.breaker
                        .call(|| async {
                            match tokio::time::timeout(
                                self.deadline,
                                self.inner.embed_image(&bytes),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(GatewayError::timeout(
                                    "IMAGE_EMBED_DEADLINE",
                                    "image embedding deadline exceeded",
                                )),
                            }
                        })
                        .await
                }
            })
            .await
    }
}

struct ResilientVision {
    inner: Arc<dyn VisionService>,
    retryer: Retryer,
    breaker: CircuitBreaker,
    deadline: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl VisionService for ResilientVision {
    async fn analyze_image(&self, bytes: &Bytes) -> GatewayResult<ImageAnalysis> {
        let bytes = bytes.clone();
        self.retryer
            .execute(&self.cancel, |_| {
                let bytes = bytes.clone();
                async move {
                    self.breaker
                        .call(|| async {
                            match tokio::time::timeout(
                                self.deadline,
                                self.inner.analyze_image(&bytes),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_) => Err(GatewayError::timeout(
                                    "VISION_DEADLINE",
                                    "image analysis deadline exceeded",
                                )),
                            }
                        })
                        .await
                }
            })
            .await
    }
}

/// The composition root: owns every component and exposes the gateway's
/// operation surface. No global state; tests build their own instance.
pub struct GatewayService {
    config: AppConfig,
    store: Arc<ChunkStore>,
    vectors: Arc<dyn VectorIndex>,
    pipeline: Arc<IngestionPipeline>,
    embed: EmbedService,
    embed_worker: Mutex<Option<EmbedWorker>>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: Arc<ConnectivityMonitor>,
    engine: Arc<RetrievalEngine>,
    library: Arc<MediaLibrary>,
    batch: BatchProcessor,
    content_cache: Arc<SharedCache<String, String>>,
    api_cache: Arc<SharedCache<String, serde_json::Value>>,
    cache_coordinator: Arc<CacheCoordinator>,
    health: HealthChecker,
    metrics: MetricsCollector,
    priorities: OpPriorities,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayService {
    pub async fn new(config: AppConfig, deps: GatewayDeps) -> GatewayResult<Self> {
        notemesh_core::init_tracing();

        let cancel = CancellationToken::new();
        let metrics = MetricsCollector::default();
        let store = Arc::new(ChunkStore::with_tag_inheritance(config.store.tag_inheritance));

        let retry_policy = RetryPolicy {
            max_retries: config.resilience.max_retries,
            base_delay: Duration::from_millis(config.resilience.base_delay_ms),
            max_delay: Duration::from_millis(config.resilience.max_delay_ms),
            factor: config.resilience.factor,
            jitter: config.resilience.jitter,
            retryable_kinds: None,
        };
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.resilience.breaker_failure_threshold,
            reset_timeout: Duration::from_millis(config.resilience.breaker_reset_timeout_ms),
            max_requests: config.resilience.breaker_max_requests,
        };
        let embed_deadline = Duration::from_millis(config.resilience.embed_timeout_ms);

        let embedder: Arc<dyn TextEmbedder> = Arc::new(ResilientTextEmbedder {
            inner: deps.embedder,
            retryer: Retryer::new(retry_policy.clone()),
            breaker: CircuitBreaker::new("text_embedding", breaker_config.clone()),
            deadline: embed_deadline,
            cancel: cancel.child_token(),
        });
        let image_embedder: Arc<dyn ImageEmbedder> = Arc::new(ResilientImageEmbedder {
            inner: deps.image_embedder,
            retryer: Retryer::new(retry_policy.clone()),
            breaker: CircuitBreaker::new("image_embedding", breaker_config.clone()),
            deadline: embed_deadline,
            cancel: cancel.child_token(),
        });
        let vision: Arc<dyn VisionService> = Arc::new(ResilientVision {
            inner: deps.vision,
            retryer: Retryer::new(retry_policy),
            breaker: CircuitBreaker::new("vision", breaker_config),
            deadline: embed_deadline,
            cancel: cancel.child_token(),
        });

        let (embed, embed_worker) =
            EmbedService::channel(store.clone(), deps.vectors.clone(), embedder.clone());

        let parser = Parser::new(ParserConfig {
            spaces_per_indent: config.ingestion.spaces_per_indent,
        });
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            deps.vectors.clone(),
            embed.clone(),
            parser,
            config.ingestion.clone(),
        ));

        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let sync_config = SyncConfig::from_settings(&config.sync);
        let base_coordinator = match &config.sync.persist_dir {
            Some(dir) => {
                SyncCoordinator::open_persistent(
                    dir,
                    deps.remote.clone(),
                    connectivity.clone(),
                    sync_config,
                )
                .await?
            }
            None => SyncCoordinator::new(deps.remote.clone(), connectivity.clone(), sync_config),
        };
        let hook_store = store.clone();
        let hook_embed = embed.clone();
        let coordinator = Arc::new(base_coordinator.with_remote_apply_hook(move |chunk| {
            let store = hook_store.clone();
            let embed = hook_embed.clone();
            let chunk = chunk.clone();
            tokio::spawn(async move {
                let chunk_id = chunk.chunk_id;
                let contents = chunk.contents.clone();
                let contents_hash = chunk.contents_hash();
                if let Err(err) = store.put(chunk, None).await {
                    warn!(chunk_id = %chunk_id, error = %err, "remote-wins apply failed");
                    return;
                }
                let _ = embed.enqueue(EmbedJob {
                    chunk_id,
                    contents,
                    contents_hash,
                });
            });
        }));

        let search_cache = SharedCache::new(
            "search",
            CacheConfig {
                max_entries: config.cache.search_max_entries,
                max_bytes: config.cache.search_max_bytes,
                default_ttl: Duration::from_millis(config.cache.search_ttl_ms),
            },
        );
        let content_cache = SharedCache::new(
            "content",
            CacheConfig {
                max_entries: config.cache.content_max_entries,
                max_bytes: config.cache.content_max_bytes,
                default_ttl: Duration::from_millis(config.cache.content_ttl_ms),
            },
        );
        let api_cache = SharedCache::new(
            "api",
            CacheConfig {
                max_entries: config.cache.api_max_entries,
                max_bytes: config.cache.api_max_bytes,
                default_ttl: Duration::from_millis(config.cache.api_ttl_ms),
            },
        );
        let mut cache_coordinator = CacheCoordinator::new(
            config.cache.global_memory_limit,
            Duration::from_millis(config.cache.cleanup_interval_ms),
        );
        cache_coordinator.register(search_cache.clone());
        cache_coordinator.register(content_cache.clone());
        cache_coordinator.register(api_cache.clone());
        let cache_coordinator = Arc::new(cache_coordinator);

        let engine = Arc::new(RetrievalEngine::new(
            store.clone(),
            deps.vectors.clone(),
            deps.image_vectors.clone(),
            embedder,
            image_embedder.clone(),
            search_cache,
            metrics.clone(),
            config.retrieval.clone(),
        ));

        let library = Arc::new(MediaLibrary::new(
            store.clone(),
            deps.blob.clone(),
            vision,
            image_embedder,
            deps.image_vectors.clone(),
        ));
        let batch = BatchProcessor::new(library.clone(), config.media.concurrency);

        let health = HealthChecker::new(
            store.clone(),
            deps.vectors.clone(),
            deps.remote,
            deps.blob,
        );

        Ok(Self {
            config,
            store,
            vectors: deps.vectors,
            pipeline,
            embed,
            embed_worker: Mutex::new(Some(embed_worker)),
            coordinator,
            connectivity,
            engine,
            library,
            batch,
            content_cache,
            api_cache,
            cache_coordinator,
            health,
            metrics,
            priorities: OpPriorities::default(),
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background workers: embed worker, sync loop, cache cleanup.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(worker) = self.embed_worker.lock().await.take() {
            tasks.push(tokio::spawn(worker.run(self.cancel.child_token())));
        }
        tasks.push(tokio::spawn(self.coordinator.clone().run()));
        tasks.push(
            self.cache_coordinator
                .clone()
                .spawn_cleanup(self.cancel.child_token()),
        );
        info!("gateway started");
    }

    /// Cancel background work, flush the queue snapshot, and join workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.coordinator.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        info!("gateway stopped");
    }

    /// Drain the embed queue inline; test and flush support when the
    /// background worker is not running.
    pub async fn drain_embeds(&self) {
        if let Some(worker) = self.embed_worker.lock().await.as_mut() {
            worker.run_until_idle().await;
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    // ---- document ingestion -------------------------------------------------

    pub async fn ingest_document(
        &self,
        document_id: &str,
        text: &str,
    ) -> GatewayResult<IngestReport> {
        let start = Instant::now();
        let result = self.pipeline.ingest(document_id, text).await;
        if let Ok(report) = &result {
            self.coordinator.enqueue_all(report.ops.clone()).await?;
            self.invalidate_document(document_id);
        }
        self.observe("POST", "/documents", start, &result);
        result
    }

    /// Position-ordered rendering of a document, cached by source id.
    pub async fn get_document(&self, document_id: &str) -> GatewayResult<String> {
        if let Some(text) = self.content_cache.get(&document_id.to_string()) {
            return Ok(text);
        }
        let page = self.store.by_document(document_id, None, usize::MAX).await?;
        if page.chunks.is_empty() {
            return Err(GatewayError::not_found(
                "DOCUMENT_NOT_FOUND",
                format!("no chunks for document '{document_id}'"),
            ));
        }
        let text = storage::render_document(&page.chunks);
        self.content_cache
            .insert(document_id.to_string(), text.clone(), text.len(), None);
        Ok(text)
    }

    // ---- chunk CRUD ---------------------------------------------------------

    pub async fn create_chunk(&self, chunk: Chunk) -> GatewayResult<Chunk> {
        let start = Instant::now();
        let result = self.store.put(chunk, None).await;
        if let Ok(stored) = &result {
            self.coordinator
                .enqueue(SyncOp::new(
                    stored.chunk_id,
                    &stored.document_id,
                    OpPayload::Create {
                        chunk: stored.clone(),
                    },
                    &self.priorities,
                ))
                .await?;
            self.request_embed(stored);
            self.invalidate_document(&stored.document_id);
        }
        self.observe("POST", "/chunks", start, &result);
        result
    }

    pub async fn get_chunk(&self, id: ChunkId) -> GatewayResult<Chunk> {
        let start = Instant::now();
        let result = self.store.get(id).await;
        self.observe("GET", "/chunks/{id}", start, &result);
        result
    }

    pub async fn update_chunk(&self, id: ChunkId, patch: ChunkPatch) -> GatewayResult<Chunk> {
        let start = Instant::now();
        let result = self.apply_patch(id, patch).await;
        self.observe("PUT", "/chunks/{id}", start, &result);
        result
    }

    async fn apply_patch(&self, id: ChunkId, patch: ChunkPatch) -> GatewayResult<Chunk> {
        let stored = self.store.get(id).await?;
        let baseline_version = self.store.version_of(id).await;
        let baseline = OpBaseline::of(&stored, baseline_version);

        let mut updated = stored.clone();
        let mut content_changed = false;
        if let Some(contents) = patch.contents {
            content_changed = contents != updated.contents;
            updated.contents = contents;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        if let Some(parent) = patch.parent {
            updated.parent = parent;
        }
        if let Some(ref_id) = patch.ref_id {
            updated.ref_id = ref_id;
        }
        if let Some(position) = patch.position {
            updated.position = Some(position);
        }
        updated.touch();

        if content_changed {
            // The stale vector goes away before the new write is visible.
            if let Err(err) = self.vectors.delete(id).await {
                warn!(chunk_id = %id, error = %err, "vector invalidation failed");
            }
        }

        let updated = self.store.put(updated, patch.expected_version).await?;
        self.coordinator
            .enqueue(SyncOp::new(
                id,
                &updated.document_id,
                OpPayload::Update {
                    chunk: updated.clone(),
                    baseline: Some(baseline),
                },
                &self.priorities,
            ))
            .await?;
        if content_changed {
            self.request_embed(&updated);
        }
        self.invalidate_document(&updated.document_id);
        Ok(updated)
    }

    pub async fn delete_chunk(
        &self,
        id: ChunkId,
        cascade: CascadeMode,
    ) -> GatewayResult<DeleteOutcome> {
        let start = Instant::now();
        let document_id = match self.store.get(id).await {
            Ok(chunk) => chunk.document_id,
            Err(err) => {
                let result = Err(err);
                self.observe("DELETE", "/chunks/{id}", start, &result);
                return result;
            }
        };

        let result = self.store.delete(id, cascade).await;
        if let Ok(outcome) = &result {
            for deleted in &outcome.deleted {
                if let Err(err) = self.vectors.delete(*deleted).await {
                    warn!(chunk_id = %deleted, error = %err, "vector cleanup failed");
                }
            }
            self.coordinator
                .enqueue(SyncOp::new(
                    id,
                    &document_id,
                    OpPayload::Delete { cascade },
                    &self.priorities,
                ))
                .await?;
            self.invalidate_document(&document_id);
        }
        self.observe("DELETE", "/chunks/{id}", start, &result);
        result
    }

    /// The chunk plus its subtree, position-ordered.
    pub async fn hierarchy(&self, id: ChunkId) -> GatewayResult<Vec<Chunk>> {
        let start = Instant::now();
        let result = async {
            let root = self.store.get(id).await?;
            let mut out = vec![root];
            out.extend(
                self.store
                    .descendants(id, storage::MAX_ANCESTOR_DEPTH)
                    .await?,
            );
            Ok(out)
        }
        .await;
        self.observe("GET", "/chunks/{id}/hierarchy", start, &result);
        result
    }

    pub async fn move_chunk(
        &self,
        id: ChunkId,
        new_parent: Option<ChunkId>,
    ) -> GatewayResult<Chunk> {
        let start = Instant::now();
        let result = self.store.move_chunk(id, new_parent).await;
        if let Ok(moved) = &result {
            self.coordinator
                .enqueue(SyncOp::new(
                    id,
                    &moved.document_id,
                    OpPayload::Move { new_parent },
                    &self.priorities,
                ))
                .await?;
            self.invalidate_document(&moved.document_id);
        }
        self.observe("POST", "/chunks/{id}/move", start, &result);
        result
    }

    /// Best-effort bulk create with a per-item status list.
    pub async fn batch_create(&self, chunks: Vec<Chunk>) -> Vec<BatchItemStatus> {
        let mut out = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            match self.create_chunk(chunk).await {
                Ok(created) => out.push(BatchItemStatus {
                    index,
                    chunk_id: Some(created.chunk_id),
                    ok: true,
                    error: None,
                }),
                Err(err) => out.push(BatchItemStatus {
                    index,
                    chunk_id: None,
                    ok: false,
                    error: Some(ErrorEnvelope::from(&err).error),
                }),
            }
        }
        out
    }

    pub async fn batch_update(&self, updates: Vec<(ChunkId, ChunkPatch)>) -> Vec<BatchItemStatus> {
        let mut out = Vec::with_capacity(updates.len());
        for (index, (id, patch)) in updates.into_iter().enumerate() {
            match self.update_chunk(id, patch).await {
                Ok(_) => out.push(BatchItemStatus {
                    index,
                    chunk_id: Some(id),
                    ok: true,
                    error: None,
                }),
                Err(err) => out.push(BatchItemStatus {
                    index,
                    chunk_id: Some(id),
                    ok: false,
                    error: Some(ErrorEnvelope::from(&err).error),
                }),
            }
        }
        out
    }

    // ---- retrieval ----------------------------------------------------------

    pub async fn search_semantic(&self, query: &SemanticQuery) -> GatewayResult<SearchPage> {
        self.engine.semantic(query).await
    }

    pub async fn search_tags(&self, query: &TagQuery) -> GatewayResult<SearchPage> {
        self.engine.tag(query).await
    }

    pub async fn search_multimodal(&self, query: &HybridQuery) -> GatewayResult<SearchPage> {
        self.engine.hybrid(query).await
    }

    pub async fn search_image_similarity(
        &self,
        query: &ImageSimilarityQuery,
    ) -> GatewayResult<SearchPage> {
        self.engine.image_similarity(query).await
    }

    pub async fn slide_recommendations(
        &self,
        document_id: &str,
        source: ImageSource,
        limit: usize,
    ) -> GatewayResult<SearchPage> {
        self.engine
            .slide_recommendations(document_id, source, limit)
            .await
    }

    pub async fn duplicate_images(
        &self,
        source: ImageSource,
        limit: usize,
    ) -> GatewayResult<SearchPage> {
        self.engine.duplicate_images(source, limit).await
    }

    // ---- media --------------------------------------------------------------

    pub async fn upload_media(
        &self,
        bytes: Bytes,
        mime_type: &str,
        document_id: Option<String>,
    ) -> GatewayResult<MediaUploadResponse> {
        let start = Instant::now();
        let options = UploadOptions {
            document_id,
            analyze: self.config.media.analyze_on_upload,
            embed: self.config.media.embed_on_upload,
        };
        let result = self.library.upload(bytes, mime_type, &options).await;
        let response = result.map(|outcome| MediaUploadResponse {
            chunk_id: outcome.chunk_id,
            url: outcome.url,
            reused: outcome.reused,
            analysis: outcome.analysis,
        });
        self.observe("POST", "/media/upload", start, &response);
        response
    }

    pub async fn media_library(&self, page: usize, page_size: usize) -> MediaListing {
        self.library.list(page, page_size).await
    }

    pub fn batch_upload(
        &self,
        tasks: Vec<UploadTask>,
    ) -> (watch::Receiver<BatchProgress>, JoinHandle<BatchReport>) {
        self.batch.start(tasks, self.cancel.child_token())
    }

    // ---- sync & connectivity ------------------------------------------------

    pub fn set_offline(&self) {
        self.connectivity.set_online(false);
    }

    pub async fn on_online(&self) -> GatewayResult<usize> {
        self.coordinator.on_online().await
    }

    pub async fn flush_sync(&self) -> GatewayResult<usize> {
        self.coordinator.flush().await
    }

    pub async fn sync_stats(&self) -> SyncStats {
        self.coordinator.stats().await
    }

    pub async fn sync_queue_len(&self) -> usize {
        self.coordinator.queue_len().await
    }

    pub async fn dead_letters(&self) -> Vec<sync::DeadLetter> {
        self.coordinator.dead_letters().await
    }

    pub async fn manual_conflicts(&self) -> Vec<sync::SyncConflict> {
        self.coordinator.manual_conflicts().await
    }

    pub async fn resolve_conflict(
        &self,
        chunk_id: ChunkId,
        strategy: ResolutionStrategy,
    ) -> GatewayResult<usize> {
        self.coordinator.resolve_manual(chunk_id, strategy).await
    }

    // ---- observability ------------------------------------------------------

    pub fn liveness(&self) -> bool {
        self.health.liveness()
    }

    pub async fn readiness(&self) -> bool {
        self.health.readiness().await
    }

    pub async fn health(&self) -> HealthReport {
        self.health.health().await
    }

    pub async fn metrics_response(&self) -> MetricsResponse {
        let queue_depth = self.coordinator.queue_len().await;
        self.metrics.set_queue_depth(queue_depth as u64);
        self.metrics
            .set_cache_bytes(self.cache_coordinator.total_bytes() as u64);
        MetricsResponse {
            metrics: self.metrics.snapshot(),
            caches: self.cache_coordinator.stats(),
            sync: self.coordinator.stats().await,
            queue_depth,
        }
    }

    /// Explicit cache clear for tests and post-migration warmups.
    pub fn clear_caches(&self, scope: Option<&str>) {
        self.cache_coordinator.clear(scope);
    }

    fn request_embed(&self, chunk: &Chunk) {
        if chunk.contents.trim().is_empty() || chunk.flags.is_tag {
            return;
        }
        if let Err(err) = self.embed.enqueue(EmbedJob {
            chunk_id: chunk.chunk_id,
            contents: chunk.contents.clone(),
            contents_hash: chunk.contents_hash(),
        }) {
            warn!(chunk_id = %chunk.chunk_id, error = %err, "embed enqueue rejected");
        }
    }

    /// Write-path invalidation: content cache by document, search results and
    /// API responses wholesale. TTL bounds any staleness that slips through.
    fn invalidate_document(&self, document_id: &str) {
        self.content_cache.remove(&document_id.to_string());
        self.engine.invalidate_search_cache();
        self.api_cache.clear_all();
    }

    fn observe<T>(&self, method: &str, endpoint: &str, start: Instant, result: &GatewayResult<T>) {
        let status = match result {
            Ok(_) => 200,
            Err(err) => {
                self.metrics.record_error(err.kind);
                err.http_status()
            }
        };
        self.metrics
            .record_request(method, endpoint, status, start.elapsed().as_millis() as u64);
    }
}
