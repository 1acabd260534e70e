use crate::request::{
    FulltextQuery, HybridQuery, ImageSimilarityQuery, ImageSource, QueryFilters,
    QueryValidationError, SemanticQuery, TagQuery,
};
use ingestion::TextEmbedder;
use media::ImageEmbedder;
use notemesh_core::cache::SharedCache;
use notemesh_core::config::RetrievalConfig;
use notemesh_core::error::{ErrorKind, GatewayError, GatewayResult};
use notemesh_core::metrics::{MetricsCollector, SlowQueryRecord};
use notemesh_core::model::{sha256_hex, Chunk, ChunkId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use storage::{ChunkStore, KnnFilter, TagFilters, TagLogic, VectorIndex};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<SearchHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

/// C6: composes vector search, tag algebra, fulltext, and image similarity
/// into ranked, cursor-paginated results, with result caching and slow-query
/// accounting.
pub struct RetrievalEngine {
    store: Arc<ChunkStore>,
    vectors: Arc<dyn VectorIndex>,
    image_vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn TextEmbedder>,
    image_embedder: Arc<dyn ImageEmbedder>,
    search_cache: Arc<SharedCache<String, SearchPage>>,
    metrics: MetricsCollector,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkStore>,
        vectors: Arc<dyn VectorIndex>,
        image_vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn TextEmbedder>,
        image_embedder: Arc<dyn ImageEmbedder>,
        search_cache: Arc<SharedCache<String, SearchPage>>,
        metrics: MetricsCollector,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            image_vectors,
            embedder,
            image_embedder,
            search_cache,
            metrics,
            config,
        }
    }

    /// Best-effort cache invalidation after writes; TTL guards correctness.
    pub fn invalidate_search_cache(&self) {
        self.search_cache.clear_all();
    }

    pub async fn semantic(&self, query: &SemanticQuery) -> GatewayResult<SearchPage> {
        query.validate().map_err(invalid)?;
        let start = Instant::now();
        let cache_key = cache_key("semantic", query);
        if let Some(page) = self.search_cache.get(&cache_key) {
            return Ok(page);
        }

        match self
            .semantic_hits(&query.query, &query.tags, &query.filters)
            .await
        {
            Ok(mut hits) => {
                let candidates = hits.len();
                rank(&mut hits);
                let page = paginate(hits, query.cursor.as_deref(), query.limit)?;
                self.account("semantic", candidates, &page, start, || {
                    redact(&query.query, self.config.slow_query_payload_cap)
                });
                self.search_cache
                    .insert(cache_key, page.clone(), page_weight(&page), None);
                Ok(page)
            }
            Err(err) if self.config.fulltext_fallback && is_backend_unavailable(&err) => {
                warn!(error = %err, "vector path unavailable, serving fulltext fallback");
                let fallback = FulltextQuery {
                    query: query.query.clone(),
                    filters: query.filters.clone(),
                    limit: query.limit,
                    cursor: query.cursor.clone(),
                };
                self.fulltext(&fallback).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn tag(&self, query: &TagQuery) -> GatewayResult<SearchPage> {
        query.validate().map_err(invalid)?;
        let start = Instant::now();
        let cache_key = cache_key("tag", query);
        if let Some(page) = self.search_cache.get(&cache_key) {
            return Ok(page);
        }

        let mut hits = self
            .tag_hits(&query.tags, query.logic, &query.filters)
            .await?;
        let candidates = hits.len();
        rank(&mut hits);
        let total = hits.len();
        let mut page = paginate(hits, query.cursor.as_deref(), query.limit)?;
        page.total = Some(total);
        self.account("tag", candidates, &page, start, || {
            format!("{} tags, {:?}", query.tags.len(), query.logic)
        });
        self.search_cache
            .insert(cache_key, page.clone(), page_weight(&page), None);
        Ok(page)
    }

    /// Case-insensitive token/substring match over contents; the degraded
    /// path when the vector backend is unreachable.
    pub async fn fulltext(&self, query: &FulltextQuery) -> GatewayResult<SearchPage> {
        query.validate().map_err(invalid)?;
        let start = Instant::now();

        let filters = to_tag_filters(&query.filters);
        let chunks = self.store.scan(&filters).await;
        let candidates = chunks.len();

        let mut hits: Vec<SearchHit> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let score = fulltext_score(&query.query, &chunk.contents);
                (score > 0.0).then_some(SearchHit { chunk, score })
            })
            .collect();
        rank(&mut hits);
        let page = paginate(hits, query.cursor.as_deref(), query.limit)?;
        self.account("fulltext", candidates, &page, start, || {
            redact(&query.query, self.config.slow_query_payload_cap)
        });
        Ok(page)
    }

    /// Weighted fusion of semantic and tag scores:
    /// `score = alpha * semantic + (1 - alpha) * tag_match`.
    pub async fn hybrid(&self, query: &HybridQuery) -> GatewayResult<SearchPage> {
        query.validate().map_err(invalid)?;
        let start = Instant::now();
        let alpha = query.alpha.unwrap_or(self.config.hybrid_alpha);
        let cache_key = cache_key("hybrid", query);
        if let Some(page) = self.search_cache.get(&cache_key) {
            return Ok(page);
        }

        let (semantic, tag) = tokio::join!(
            self.semantic_hits(&query.query, &[], &query.filters),
            self.tag_hits(&query.tags, TagLogic::Or, &query.filters)
        );
        let semantic = semantic?;
        let tag = match tag {
            Ok(hits) => hits,
            Err(_) if query.tags.is_empty() => Vec::new(),
            Err(err) => return Err(err),
        };

        let mut fused: HashMap<ChunkId, SearchHit> = HashMap::new();
        for hit in &semantic {
            fused.insert(
                hit.chunk.chunk_id,
                SearchHit {
                    chunk: hit.chunk.clone(),
                    score: alpha * hit.score,
                },
            );
        }
        for hit in &tag {
            let fused_score = (1.0 - alpha) * hit.score;
            fused
                .entry(hit.chunk.chunk_id)
                .and_modify(|existing| existing.score += fused_score)
                .or_insert_with(|| SearchHit {
                    chunk: hit.chunk.clone(),
                    score: fused_score,
                });
        }

        let candidates = fused.len();
        let mut hits: Vec<SearchHit> = fused.into_values().collect();
        rank(&mut hits);
        let page = paginate(hits, query.cursor.as_deref(), query.limit)?;
        self.account("hybrid", candidates, &page, start, || {
            redact(&query.query, self.config.slow_query_payload_cap)
        });
        self.search_cache
            .insert(cache_key, page.clone(), page_weight(&page), None);
        Ok(page)
    }

    pub async fn image_similarity(
        &self,
        query: &ImageSimilarityQuery,
    ) -> GatewayResult<SearchPage> {
        query.validate().map_err(invalid)?;
        let start = Instant::now();

        let (vector, exclude) = match &query.source {
            ImageSource::Bytes(bytes) => (self.image_embedder.embed_image(bytes).await?, None),
            ImageSource::Chunk(chunk_id) => {
                let vector = self.image_vectors.fetch(*chunk_id).await?.ok_or_else(|| {
                    GatewayError::not_found(
                        "IMAGE_EMBEDDING_NOT_FOUND",
                        format!("chunk {chunk_id} has no image embedding"),
                    )
                })?;
                (vector, Some(*chunk_id))
            }
        };

        let filter = KnnFilter {
            tags: query.tags.clone(),
            document_id: query.document_id.clone(),
            ..KnnFilter::default()
        };
        let neighbors = self
            .image_vectors
            .knn(&vector, query.limit + 1, &filter)
            .await?;
        let candidates = neighbors.len();

        let mut hits = Vec::new();
        for (chunk_id, score) in neighbors {
            if Some(chunk_id) == exclude {
                continue;
            }
            if let Some(threshold) = query.threshold {
                if score < threshold {
                    continue;
                }
            }
            if let Ok(chunk) = self.store.get(chunk_id).await {
                hits.push(SearchHit { chunk, score });
            }
        }
        rank(&mut hits);
        hits.truncate(query.limit);
        let page = SearchPage {
            items: hits,
            next_cursor: None,
            total: None,
        };
        self.account("image_similarity", candidates, &page, start, || {
            "image query".to_string()
        });
        Ok(page)
    }

    /// Image similarity constrained to one presentation document.
    pub async fn slide_recommendations(
        &self,
        document_id: &str,
        source: ImageSource,
        limit: usize,
    ) -> GatewayResult<SearchPage> {
        let query = ImageSimilarityQuery {
            source,
            tags: Vec::new(),
            document_id: Some(document_id.to_string()),
            limit,
            threshold: Some(self.config.slide_similarity_threshold),
        };
        self.image_similarity(&query).await
    }

    /// Near-duplicate detection across all images in scope.
    pub async fn duplicate_images(
        &self,
        source: ImageSource,
        limit: usize,
    ) -> GatewayResult<SearchPage> {
        let query = ImageSimilarityQuery {
            source,
            tags: Vec::new(),
            document_id: None,
            limit,
            threshold: Some(self.config.duplicate_image_threshold),
        };
        self.image_similarity(&query).await
    }

    async fn semantic_hits(
        &self,
        text: &str,
        tags: &[ChunkId],
        filters: &QueryFilters,
    ) -> GatewayResult<Vec<SearchHit>> {
        let vectors = self.embedder.embed_text(&[text.to_string()]).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            GatewayError::external("EMPTY_EMBED_BATCH", "embedder returned no vectors")
        })?;

        let filter = KnnFilter {
            tags: tags.to_vec(),
            document_id: filters.document_id.clone(),
            document_scope: filters.document_scope,
            updated_after: filters.updated_after,
            updated_before: filters.updated_before,
        };
        let neighbors = self
            .vectors
            .knn(&vector, self.config.max_limit, &filter)
            .await?;

        let mut hits = Vec::with_capacity(neighbors.len());
        for (chunk_id, score) in neighbors {
            if score <= 0.0 {
                continue;
            }
            // The vector index may lag behind deletes; skip orphans.
            if let Ok(chunk) = self.store.get(chunk_id).await {
                hits.push(SearchHit { chunk, score });
            }
        }
        Ok(hits)
    }

    async fn tag_hits(
        &self,
        tags: &[ChunkId],
        logic: TagLogic,
        filters: &QueryFilters,
    ) -> GatewayResult<Vec<SearchHit>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self
            .store
            .by_tags(tags, logic, &to_tag_filters(filters))
            .await?;
        let match_counts = self.store.tag_match_counts(&ids, tags).await;

        let mut hits = Vec::with_capacity(ids.len());
        for id in ids {
            let score = match logic {
                TagLogic::And => 1.0,
                TagLogic::Or => {
                    *match_counts.get(&id).unwrap_or(&0) as f32 / tags.len() as f32
                }
            };
            if let Ok(chunk) = self.store.get(id).await {
                hits.push(SearchHit { chunk, score });
            }
        }
        Ok(hits)
    }

    fn account<F: FnOnce() -> String>(
        &self,
        kind: &str,
        candidate_count: usize,
        page: &SearchPage,
        start: Instant,
        payload: F,
    ) {
        let wall_time_ms = start.elapsed().as_millis() as u64;
        self.metrics
            .record_request("query", kind, 200, wall_time_ms);
        debug!(
            kind,
            candidate_count,
            returned = page.items.len(),
            wall_time_ms,
            "query executed"
        );
        if wall_time_ms >= self.config.slow_query_threshold_ms {
            let record = SlowQueryRecord {
                kind: kind.to_string(),
                candidate_count,
                returned_count: page.items.len(),
                wall_time_ms,
                payload: payload(),
            };
            warn!(kind, wall_time_ms, "slow query");
            self.metrics.record_slow_query(record);
        }
    }
}

fn invalid(err: QueryValidationError) -> GatewayError {
    GatewayError::validation("INVALID_QUERY", err.to_string())
}

fn is_backend_unavailable(err: &GatewayError) -> bool {
    matches!(
        err.kind,
        ErrorKind::Network | ErrorKind::ExternalService | ErrorKind::Timeout | ErrorKind::Database
    )
}

fn to_tag_filters(filters: &QueryFilters) -> TagFilters {
    TagFilters {
        document_id: filters.document_id.clone(),
        document_scope: filters.document_scope,
        updated_after: filters.updated_after,
        updated_before: filters.updated_before,
    }
}

/// Primary: score descending. Ties: newer `last_updated` first, then smaller
/// chunk_id.
fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.chunk.last_updated.cmp(&a.chunk.last_updated))
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });
}

/// Cursor on (score, chunk_id): stable across calls while the underlying
/// result set is unchanged.
fn encode_cursor(hit: &SearchHit) -> String {
    format!("{:08x}:{}", hit.score.to_bits(), hit.chunk.chunk_id)
}

fn decode_cursor(raw: &str) -> Result<(f32, ChunkId), QueryValidationError> {
    let (bits, id) = raw.split_once(':').ok_or(QueryValidationError::BadCursor)?;
    let bits = u32::from_str_radix(bits, 16).map_err(|_| QueryValidationError::BadCursor)?;
    let id = id.parse().map_err(|_| QueryValidationError::BadCursor)?;
    Ok((f32::from_bits(bits), id))
}

fn paginate(
    hits: Vec<SearchHit>,
    cursor: Option<&str>,
    limit: usize,
) -> GatewayResult<SearchPage> {
    let skip = match cursor {
        Some(raw) => {
            let (score, chunk_id) = decode_cursor(raw).map_err(invalid)?;
            hits.iter()
                .position(|hit| {
                    hit.score < score
                        || (hit.score == score && hit.chunk.chunk_id > chunk_id)
                })
                .unwrap_or(hits.len())
        }
        None => 0,
    };

    let remaining = hits.len().saturating_sub(skip);
    let items: Vec<SearchHit> = hits.into_iter().skip(skip).take(limit).collect();
    let next_cursor = if remaining > items.len() {
        items.last().map(encode_cursor)
    } else {
        None
    };
    Ok(SearchPage {
        items,
        next_cursor,
        total: None,
    })
}

fn fulltext_score(needle: &str, haystack: &str) -> f32 {
    let needle_lower = needle.to_lowercase();
    let haystack_lower = haystack.to_lowercase();
    if needle_lower.trim().is_empty() {
        return 0.0;
    }
    if haystack_lower.contains(needle_lower.trim()) {
        return 1.0;
    }
    let tokens: Vec<&str> = needle_lower.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let matched = tokens
        .iter()
        .filter(|token| haystack_lower.contains(**token))
        .count();
    matched as f32 / tokens.len() as f32
}

fn cache_key<T: Serialize>(kind: &str, query: &T) -> String {
    let body = serde_json::to_string(query).unwrap_or_default();
    format!("{kind}:{}", sha256_hex(body.as_bytes()))
}

fn page_weight(page: &SearchPage) -> usize {
    64 + page
        .items
        .iter()
        .map(|hit| hit.chunk.contents.len() + 128)
        .sum::<usize>()
}

fn redact(payload: &str, cap: usize) -> String {
    if payload.len() <= cap {
        payload.to_string()
    } else {
        let mut end = cap;
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}… [{} bytes redacted]", &payload[..end], payload.len() - end)
    }
}
