use notemesh_core::cache::NamedCacheStats;
use notemesh_core::error::{ErrorKind, GatewayError};
use notemesh_core::metrics::MetricsSnapshot;
use notemesh_core::model::{ChunkId, ChunkMetadata, ImageAnalysis, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use sync::SyncStats;

/// Wire error envelope: `{"error": {kind, code, message, details?, retryable}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
}

impl ErrorEnvelope {
    pub fn http_status(&self) -> u16 {
        self.error.kind.http_status()
    }
}

impl From<&GatewayError> for ErrorEnvelope {
    fn from(err: &GatewayError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind,
                code: err.code.clone(),
                message: err.message.clone(),
                details: err
                    .cause
                    .as_ref()
                    .map(|cause| serde_json::Value::String(cause.to_string())),
                retryable: err.retryable,
            },
        }
    }
}

/// Partial update body for `PUT /chunks/{id}`. Absent fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<ChunkId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChunkMetadata>,
    /// `Some(None)` detaches; `Some(Some(id))` re-parents.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub parent: Option<Option<ChunkId>>,
    #[serde(
        default,
        rename = "ref",
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub ref_id: Option<Option<ChunkId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Optimistic concurrency token; a stale value is a `conflict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Ok(Some(Option::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    #[serde(default)]
    pub new_parent: Option<ChunkId>,
}

/// Per-item status for batch create/update: best-effort, the batch call
/// itself succeeds if the request was well-formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemStatus {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<ChunkId>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUploadResponse {
    pub chunk_id: ChunkId,
    pub url: String,
    pub reused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ImageAnalysis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
    pub caches: Vec<NamedCacheStats>,
    pub sync: SyncStats,
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_taxonomy_fields() {
        let err = GatewayError::validation("CYCLIC_MOVE", "cycle detected");
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.http_status(), 400);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["kind"], "validation");
        assert_eq!(json["error"]["code"], "CYCLIC_MOVE");
        assert_eq!(json["error"]["retryable"], false);
    }

    #[test]
    fn chunk_patch_distinguishes_absent_from_null_parent() {
        let detach: ChunkPatch = serde_json::from_str(r#"{"parent": null}"#).unwrap();
        assert_eq!(detach.parent, Some(None));

        let untouched: ChunkPatch = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(untouched.parent, None);

        let id = uuid::Uuid::new_v4();
        let reparent: ChunkPatch =
            serde_json::from_str(&format!(r#"{{"parent": "{id}"}}"#)).unwrap();
        assert_eq!(reparent.parent, Some(Some(id)));
    }
}
