use async_trait::async_trait;
use bytes::Bytes;
use notemesh_core::error::GatewayResult;
use notemesh_core::model::ImageAnalysis;
use sha2::{Digest, Sha256};

/// The consumed vision service: image bytes in, description plus tags out.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn analyze_image(&self, bytes: &Bytes) -> GatewayResult<ImageAnalysis>;
}

/// The consumed image-embedding service. The dimension may differ from the
/// text embedding dimension.
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed_image(&self, bytes: &Bytes) -> GatewayResult<Vec<f32>>;
}

/// Deterministic stand-in analysis keyed off the content hash.
pub struct MockVisionService;

#[async_trait]
impl VisionService for MockVisionService {
    async fn analyze_image(&self, bytes: &Bytes) -> GatewayResult<ImageAnalysis> {
        let digest = Sha256::digest(bytes);
        Ok(ImageAnalysis {
            description: format!("image {:02x}{:02x} ({} bytes)", digest[0], digest[1], bytes.len()),
            tags: vec!["image".to_string()],
            confidence: 0.5,
        })
    }
}

/// Byte-content hashed pseudo-embedding: identical bytes embed identically,
/// which is what duplicate detection needs in tests.
pub struct HashingImageEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashingImageEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashingImageEmbedder {
    fn default() -> Self {
        Self::new("image-embed-v1", 128)
    }
}

#[async_trait]
impl ImageEmbedder for HashingImageEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_image(&self, bytes: &Bytes) -> GatewayResult<Vec<f32>> {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id.as_bytes());
        hasher.update(bytes);
        let digest = hasher.finalize();

        let mut out = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let byte = digest[i % digest.len()];
            out.push((byte as f32 / 127.5) - 1.0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_bytes_embed_identically() {
        let embedder = HashingImageEmbedder::default();
        let a = embedder.embed_image(&Bytes::from_static(b"pixels")).await.unwrap();
        let b = embedder.embed_image(&Bytes::from_static(b"pixels")).await.unwrap();
        let c = embedder.embed_image(&Bytes::from_static(b"other")).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 128);
    }
}
