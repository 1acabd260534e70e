use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use notemesh_core::error::{GatewayError, GatewayResult};

/// The consumed blob store. Keys are derived from the SHA-256 of content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> GatewayResult<String>;
    async fn get(&self, key: &str) -> GatewayResult<Bytes>;
    async fn delete(&self, key: &str) -> GatewayResult<()>;
    async fn ping(&self) -> GatewayResult<()>;
}

/// In-memory blob store for tests and offline runs.
pub struct InMemoryBlobStore {
    blobs: DashMap<String, (Bytes, String)>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> GatewayResult<String> {
        self.blobs
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("blob://{key}"))
    }

    async fn get(&self, key: &str) -> GatewayResult<Bytes> {
        self.blobs
            .get(key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| GatewayError::not_found("BLOB_NOT_FOUND", format!("no blob '{key}'")))
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
