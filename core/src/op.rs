use crate::model::{CascadeMode, Chunk, ChunkId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pre-edit view of a chunk, carried with updates so the sync coordinator can
/// detect remote drift by timestamp, checksum, or version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpBaseline {
    pub last_updated: DateTime<Utc>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl OpBaseline {
    pub fn of(chunk: &Chunk, version: Option<u64>) -> Self {
        Self {
            last_updated: chunk.last_updated,
            checksum: chunk.contents_hash(),
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpPayload {
    Create {
        chunk: Chunk,
    },
    Update {
        chunk: Chunk,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baseline: Option<OpBaseline>,
    },
    Move {
        new_parent: Option<ChunkId>,
    },
    Delete {
        cascade: CascadeMode,
    },
}

impl OpPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpPayload::Create { .. } => "create",
            OpPayload::Update { .. } => "update",
            OpPayload::Move { .. } => "move",
            OpPayload::Delete { .. } => "delete",
        }
    }
}

/// Dispatch priorities per operation kind; higher dequeues first.
/// Default ordering is creates > moves > updates > deletes, caller-overridable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPriorities {
    pub create: u8,
    pub mv: u8,
    pub update: u8,
    pub delete: u8,
}

impl Default for OpPriorities {
    fn default() -> Self {
        Self {
            create: 30,
            mv: 20,
            update: 10,
            delete: 0,
        }
    }
}

impl OpPriorities {
    pub fn for_payload(&self, payload: &OpPayload) -> u8 {
        match payload {
            OpPayload::Create { .. } => self.create,
            OpPayload::Move { .. } => self.mv,
            OpPayload::Update { .. } => self.update,
            OpPayload::Delete { .. } => self.delete,
        }
    }
}

/// One pending operation against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOp {
    pub op_id: Uuid,
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub payload: OpPayload,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl SyncOp {
    pub fn new(
        chunk_id: ChunkId,
        document_id: impl Into<String>,
        payload: OpPayload,
        priorities: &OpPriorities,
    ) -> Self {
        let priority = priorities.for_payload(&payload);
        Self {
            op_id: Uuid::new_v4(),
            chunk_id,
            document_id: document_id.into(),
            payload,
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priorities_order_create_over_delete() {
        let priorities = OpPriorities::default();
        let chunk = Chunk::new("doc", "x");
        let create = SyncOp::new(
            chunk.chunk_id,
            "doc",
            OpPayload::Create {
                chunk: chunk.clone(),
            },
            &priorities,
        );
        let delete = SyncOp::new(
            chunk.chunk_id,
            "doc",
            OpPayload::Delete {
                cascade: CascadeMode::Reparent,
            },
            &priorities,
        );
        assert!(create.priority > delete.priority);
    }
}
