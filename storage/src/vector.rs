use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notemesh_core::error::{GatewayError, GatewayResult};
use notemesh_core::model::{ChunkId, DocumentScope};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Filter expression the external vector backend is expected to support:
/// equality on tags / document id / scope, plus timestamp ranges.
#[derive(Debug, Clone, Default)]
pub struct KnnFilter {
    /// Candidate must carry every listed tag.
    pub tags: Vec<ChunkId>,
    pub document_id: Option<String>,
    pub document_scope: Option<DocumentScope>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl KnnFilter {
    pub fn matches(&self, meta: &VectorMeta) -> bool {
        if !self.tags.iter().all(|tag| meta.tags.contains(tag)) {
            return false;
        }
        if let Some(doc) = &self.document_id {
            if &meta.document_id != doc {
                return false;
            }
        }
        if let Some(scope) = self.document_scope {
            if meta.document_scope != scope {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if meta.last_updated < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if meta.last_updated > before {
                return false;
            }
        }
        true
    }
}

/// Metadata stored alongside each vector for server-side filtering.
#[derive(Debug, Clone)]
pub struct VectorMeta {
    pub tags: Vec<ChunkId>,
    pub document_id: String,
    pub document_scope: DocumentScope,
    pub last_updated: DateTime<Utc>,
}

/// The consumed vector-index interface. Exactly one current vector per
/// chunk_id; upsert replaces, delete invalidates.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, chunk_id: ChunkId, vector: Vec<f32>, meta: VectorMeta)
        -> GatewayResult<()>;
    async fn delete(&self, chunk_id: ChunkId) -> GatewayResult<()>;
    async fn fetch(&self, chunk_id: ChunkId) -> GatewayResult<Option<Vec<f32>>>;
    async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &KnnFilter,
    ) -> GatewayResult<Vec<(ChunkId, f32)>>;
    /// Cheap probe for readiness checks.
    async fn ping(&self) -> GatewayResult<()>;
}

/// Linear-scan cosine index; the stand-in for the external ANN backend.
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<ChunkId, (Vec<f32>, VectorMeta)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        chunk_id: ChunkId,
        vector: Vec<f32>,
        meta: VectorMeta,
    ) -> GatewayResult<()> {
        if vector.is_empty() {
            return Err(GatewayError::validation(
                "EMPTY_VECTOR",
                "refusing to index an empty vector",
            ));
        }
        self.entries.write().await.insert(chunk_id, (vector, meta));
        Ok(())
    }

    async fn delete(&self, chunk_id: ChunkId) -> GatewayResult<()> {
        self.entries.write().await.remove(&chunk_id);
        Ok(())
    }

    async fn fetch(&self, chunk_id: ChunkId) -> GatewayResult<Option<Vec<f32>>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&chunk_id)
            .map(|(vector, _)| vector.clone()))
    }

    async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &KnnFilter,
    ) -> GatewayResult<Vec<(ChunkId, f32)>> {
        let entries = self.entries.read().await;
        let mut scores: Vec<(ChunkId, f32)> = entries
            .iter()
            .filter(|(_, (_, meta))| filter.matches(meta))
            .filter_map(|(id, (candidate, _))| {
                cosine_similarity(vector, candidate).map(|score| (*id, score))
            })
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        Ok(scores)
    }

    async fn ping(&self) -> GatewayResult<()> {
        let _ = self.entries.read().await.len();
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}
