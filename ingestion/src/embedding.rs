use async_trait::async_trait;
use notemesh_core::error::GatewayResult;
use sha2::{Digest, Sha256};

/// The consumed text-embedding service: fixed-dimension vectors for a batch
/// of strings. Implementations are expected to be wrapped in retry and a
/// circuit breaker by the composition root.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed_text(&self, inputs: &[String]) -> GatewayResult<Vec<Vec<f32>>>;
}

/// Offline stand-in: token-bucket hashing into a fixed dimension, then L2
/// normalization. Texts sharing tokens land near each other, so semantic
/// tests are reproducible without a model.
pub struct HashingTextEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashingTextEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashingTextEmbedder {
    fn default() -> Self {
        Self::new("text-embed-v1", 256)
    }
}

#[async_trait]
impl TextEmbedder for HashingTextEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_text(&self, inputs: &[String]) -> GatewayResult<Vec<Vec<f32>>> {
        Ok(inputs
            .iter()
            .map(|text| token_embedding(text, &self.model_id, self.dimension))
            .collect())
    }
}

/// Deterministic bag-of-tokens embedding: each token hashes to a bucket and a
/// sign; the accumulated vector is L2-normalized.
pub fn token_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);
    let mut out = vec![0.0f32; dims];

    for token in tokenize(text) {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();

        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % dims;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign;
    }

    let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut out {
            *value /= norm;
        }
    }
    out
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut buffer = String::new();
    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_alphanumeric() || ch == '_' {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            tokens.push(std::mem::take(&mut buffer));
        }
    }
    if !buffer.is_empty() {
        tokens.push(buffer);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::cosine_similarity;

    #[test]
    fn embedding_is_reproducible_for_same_inputs() {
        let a = token_embedding("hello world", "text-embed-v1", 64);
        let b = token_embedding("hello world", "text-embed-v1", 64);
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_changes_when_model_changes() {
        let a = token_embedding("hello", "text-embed-v1", 64);
        let b = token_embedding("hello", "text-embed-v2", 64);
        assert_ne!(a, b);
    }

    #[test]
    fn shared_tokens_produce_positive_similarity() {
        let query = token_embedding("PostgreSQL", "text-embed-v1", 256);
        let hit = token_embedding("Para one mentions PostgreSQL.", "text-embed-v1", 256);
        let miss = token_embedding("bullet", "text-embed-v1", 256);

        let hit_score = cosine_similarity(&query, &hit).unwrap();
        let miss_score = cosine_similarity(&query, &miss).unwrap();
        assert!(hit_score > 0.0);
        assert!(hit_score > miss_score);
    }
}
