use async_trait::async_trait;
use notemesh_core::error::{ErrorKind, GatewayError, GatewayResult};
use notemesh_core::model::{Chunk, ChunkId};
use notemesh_core::op::{OpPayload, SyncOp};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;

/// The remote side of the sync pipeline (the relational+vector backend).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, chunk_id: ChunkId) -> GatewayResult<Option<Chunk>>;
    async fn apply(&self, op: &SyncOp) -> GatewayResult<()>;
    async fn ping(&self) -> GatewayResult<()>;
}

/// In-memory remote with failure injection, for tests and offline runs.
pub struct MockRemoteStore {
    chunks: RwLock<HashMap<ChunkId, Chunk>>,
    applied: StdMutex<Vec<SyncOp>>,
    failures: StdMutex<Vec<(ErrorKind, &'static str)>>,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            applied: StdMutex::new(Vec::new()),
            failures: StdMutex::new(Vec::new()),
        }
    }

    /// Queue up `n` injected failures of the given kind; subsequent applies
    /// consume them before succeeding again.
    pub fn fail_times(&self, n: usize, kind: ErrorKind, code: &'static str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..n {
            failures.push((kind, code));
        }
    }

    pub async fn seed(&self, chunk: Chunk) {
        self.chunks.write().await.insert(chunk.chunk_id, chunk);
    }

    pub fn applied_ops(&self) -> Vec<SyncOp> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn take_failure(&self) -> Option<(ErrorKind, &'static str)> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
    }
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MockRemoteStore {
    async fn fetch(&self, chunk_id: ChunkId) -> GatewayResult<Option<Chunk>> {
        Ok(self.chunks.read().await.get(&chunk_id).cloned())
    }

    async fn apply(&self, op: &SyncOp) -> GatewayResult<()> {
        if let Some((kind, code)) = self.take_failure() {
            return Err(GatewayError::new(kind, code, "injected failure"));
        }

        let mut chunks = self.chunks.write().await;
        match &op.payload {
            OpPayload::Create { chunk } | OpPayload::Update { chunk, .. } => {
                chunks.insert(chunk.chunk_id, chunk.clone());
            }
            OpPayload::Move { new_parent } => {
                if let Some(chunk) = chunks.get_mut(&op.chunk_id) {
                    chunk.parent = *new_parent;
                }
            }
            OpPayload::Delete { .. } => {
                chunks.remove(&op.chunk_id);
            }
        }
        drop(chunks);

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op.clone());
        Ok(())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
