use crate::blob::BlobStore;
use crate::vision::{ImageEmbedder, VisionService};
use bytes::Bytes;
use chrono::Utc;
use notemesh_core::config::MediaConfig;
use notemesh_core::error::GatewayResult;
use notemesh_core::model::{
    sha256_hex, Chunk, ChunkFlags, ChunkId, DocumentScope, EmbeddingRef, ImageAnalysis,
    MediaRecord, MediaRef,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use storage::{ChunkStore, VectorIndex, VectorMeta};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Attach the image chunk to this document; defaults to a synthetic
    /// per-image document.
    pub document_id: Option<String>,
    pub analyze: bool,
    pub embed: bool,
}

impl UploadOptions {
    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            document_id: None,
            analyze: config.analyze_on_upload,
            embed: config.embed_on_upload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub chunk_id: ChunkId,
    pub key: String,
    pub url: String,
    /// True when the content hash matched an existing record and the blob
    /// write was skipped.
    pub reused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ImageAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaListing {
    pub items: Vec<MediaItem>,
    pub total: usize,
    pub page: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub chunk_id: ChunkId,
    pub record: MediaRecord,
}

/// C8: content-addressed image intake. Upload computes the SHA-256, reuses
/// an existing record on a hash hit, otherwise writes the blob, creates an
/// `is_image` chunk, and optionally analyzes and embeds.
pub struct MediaLibrary {
    store: Arc<ChunkStore>,
    blob: Arc<dyn BlobStore>,
    vision: Arc<dyn VisionService>,
    image_embedder: Arc<dyn ImageEmbedder>,
    image_vectors: Arc<dyn VectorIndex>,
    records: RwLock<HashMap<String, (MediaRecord, ChunkId)>>,
}

impl MediaLibrary {
    pub fn new(
        store: Arc<ChunkStore>,
        blob: Arc<dyn BlobStore>,
        vision: Arc<dyn VisionService>,
        image_embedder: Arc<dyn ImageEmbedder>,
        image_vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            store,
            blob,
            vision,
            image_embedder,
            image_vectors,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn upload(
        &self,
        bytes: Bytes,
        mime_type: &str,
        options: &UploadOptions,
    ) -> GatewayResult<UploadOutcome> {
        let key = sha256_hex(&bytes);

        if let Some((record, chunk_id)) = self.records.read().await.get(&key).cloned() {
            info!(key = %key, "content hash matched, reusing media record");
            return Ok(UploadOutcome {
                chunk_id,
                key,
                url: record.url.clone(),
                reused: true,
                analysis: record.analysis,
            });
        }

        let url = self.blob.put(&key, bytes.clone(), mime_type).await?;

        let analysis = if options.analyze {
            match self.vision.analyze_image(&bytes).await {
                Ok(analysis) => Some(analysis),
                Err(err) => {
                    // Analysis is enrichment, not a gate.
                    warn!(key = %key, error = %err, "image analysis failed");
                    None
                }
            }
        } else {
            None
        };

        let mut chunk = Chunk::new(
            options
                .document_id
                .clone()
                .unwrap_or_else(|| format!("media:{key}")),
            analysis
                .as_ref()
                .map(|a| a.description.clone())
                .unwrap_or_default(),
        );
        chunk.flags = ChunkFlags::image();
        chunk.document_scope = if options.document_id.is_some() {
            DocumentScope::File
        } else {
            DocumentScope::Synthetic
        };
        chunk.media_ref = Some(MediaRef {
            key: key.clone(),
            mime_type: mime_type.to_string(),
        });
        if let Some(analysis) = &analysis {
            chunk.metadata.extra.insert(
                "ai_tags".into(),
                serde_json::Value::Array(
                    analysis
                        .tags
                        .iter()
                        .map(|t| serde_json::Value::String(t.clone()))
                        .collect(),
                ),
            );
        }
        let chunk = self.store.put(chunk, None).await?;

        let mut record = MediaRecord {
            key: key.clone(),
            mime_type: mime_type.to_string(),
            url: url.clone(),
            size_bytes: bytes.len(),
            analysis: analysis.clone(),
            image_embedding: None,
            created_time: Utc::now(),
        };

        if options.embed {
            let vector = self.image_embedder.embed_image(&bytes).await?;
            self.image_vectors
                .upsert(
                    chunk.chunk_id,
                    vector,
                    VectorMeta {
                        tags: chunk.tags.iter().copied().collect(),
                        document_id: chunk.document_id.clone(),
                        document_scope: chunk.document_scope,
                        last_updated: chunk.last_updated,
                    },
                )
                .await?;
            record.image_embedding = Some(EmbeddingRef {
                model_id: self.image_embedder.model_id().to_string(),
                dimension: self.image_embedder.dimension(),
                contents_hash: key.clone(),
            });
        }

        self.records
            .write()
            .await
            .insert(key.clone(), (record, chunk.chunk_id));

        Ok(UploadOutcome {
            chunk_id: chunk.chunk_id,
            key,
            url,
            reused: false,
            analysis,
        })
    }

    pub async fn get_record(&self, key: &str) -> Option<(MediaRecord, ChunkId)> {
        self.records.read().await.get(key).cloned()
    }

    /// Paginated listing for the media library surface, newest first.
    pub async fn list(&self, page: usize, page_size: usize) -> MediaListing {
        let records = self.records.read().await;
        let mut items: Vec<MediaItem> = records
            .values()
            .map(|(record, chunk_id)| MediaItem {
                chunk_id: *chunk_id,
                record: record.clone(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.record
                .created_time
                .cmp(&a.record.created_time)
                .then_with(|| a.record.key.cmp(&b.record.key))
        });
        let total = items.len();
        let page_size = page_size.max(1);
        let items = items
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect();
        MediaListing { items, total, page }
    }
}
