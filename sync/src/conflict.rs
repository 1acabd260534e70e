use notemesh_core::model::{Chunk, ChunkId};
use notemesh_core::op::OpBaseline;
use serde::{Deserialize, Serialize};

/// How remote drift is detected before an update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCheck {
    /// Remote `last_updated` is newer than the local baseline.
    #[default]
    Timestamp,
    /// Remote contents hash differs from the local baseline checksum.
    Checksum,
    /// Remote monotonic counter (metadata key `version`) is ahead.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Content,
    Metadata,
    Hierarchy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    #[default]
    RemoteWins,
    Merge,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub chunk_id: ChunkId,
    pub local: Chunk,
    pub remote: Chunk,
    pub conflict_type: ConflictType,
}

/// What the coordinator should do with a detected conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep local, overwrite remote.
    UseLocal(Chunk),
    /// Discard the local change, accept remote state.
    UseRemote(Chunk),
    /// Deterministic merge of both sides.
    Merged(Chunk),
    /// Park until an operator resolves it; no further writes to the chunk.
    Parked,
}

/// Compare the remote chunk against the local baseline. Returns the conflict
/// classification when the remote has moved since the baseline was taken.
pub fn detect(
    baseline: &OpBaseline,
    local: &Chunk,
    remote: &Chunk,
    check: ConflictCheck,
) -> Option<ConflictType> {
    let drifted = match check {
        ConflictCheck::Timestamp => remote.last_updated > baseline.last_updated,
        ConflictCheck::Checksum => remote.contents_hash() != baseline.checksum,
        ConflictCheck::Version => {
            let remote_version = metadata_version(remote);
            match (remote_version, baseline.version) {
                (Some(remote_v), Some(base_v)) => remote_v > base_v,
                (Some(_), None) => true,
                _ => false,
            }
        }
    };
    drifted.then(|| classify(local, remote))
}

pub fn classify(local: &Chunk, remote: &Chunk) -> ConflictType {
    if local.contents != remote.contents {
        ConflictType::Content
    } else if local.parent != remote.parent || local.page != remote.page {
        ConflictType::Hierarchy
    } else {
        ConflictType::Metadata
    }
}

pub fn resolve(strategy: ResolutionStrategy, conflict: &SyncConflict) -> Resolution {
    match strategy {
        ResolutionStrategy::LocalWins => Resolution::UseLocal(conflict.local.clone()),
        ResolutionStrategy::RemoteWins => Resolution::UseRemote(conflict.remote.clone()),
        ResolutionStrategy::Merge => {
            Resolution::Merged(merge_chunks(&conflict.local, &conflict.remote))
        }
        ResolutionStrategy::Manual => Resolution::Parked,
    }
}

/// Deterministic merge: union of tags; metadata merged per key with the
/// local value winning; contents concatenated with a separator when both
/// sides changed.
pub fn merge_chunks(local: &Chunk, remote: &Chunk) -> Chunk {
    let mut merged = local.clone();

    merged.tags = local.tags.union(&remote.tags).copied().collect();

    let mut metadata = remote.metadata.clone();
    if local.metadata.title.is_some() {
        metadata.title = local.metadata.title.clone();
    }
    if !local.metadata.tags.is_empty() {
        metadata.tags = local.metadata.tags.clone();
    }
    if !local.metadata.aliases.is_empty() {
        metadata.aliases = local.metadata.aliases.clone();
    }
    for (key, value) in &local.metadata.extra {
        metadata.extra.insert(key.clone(), value.clone());
    }
    metadata.block = local.metadata.block.or(remote.metadata.block);
    metadata.heading_level = local.metadata.heading_level.or(remote.metadata.heading_level);
    metadata.list_indent = local.metadata.list_indent.or(remote.metadata.list_indent);
    merged.metadata = metadata;

    if local.contents != remote.contents {
        merged.contents = format!("{}\n---\n{}", local.contents, remote.contents);
    }
    merged.last_updated = local.last_updated.max(remote.last_updated);
    merged
}

fn metadata_version(chunk: &Chunk) -> Option<u64> {
    chunk
        .metadata
        .extra
        .get("version")
        .and_then(|value| value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn pair() -> (Chunk, Chunk, OpBaseline) {
        let base = Chunk::new("doc", "original");
        let baseline = OpBaseline::of(&base, Some(1));

        let mut local = base.clone();
        local.contents = "local edit".into();
        local.touch();

        let mut remote = base;
        remote.contents = "remote edit".into();
        remote.last_updated = Utc::now() + Duration::seconds(5);
        (local, remote, baseline)
    }

    #[test]
    fn timestamp_check_detects_newer_remote() {
        let (local, remote, baseline) = pair();
        let conflict = detect(&baseline, &local, &remote, ConflictCheck::Timestamp);
        assert_eq!(conflict, Some(ConflictType::Content));
    }

    #[test]
    fn checksum_check_detects_content_drift() {
        let (local, remote, baseline) = pair();
        assert!(detect(&baseline, &local, &remote, ConflictCheck::Checksum).is_some());

        // Remote identical to baseline: no conflict.
        let untouched = Chunk::new("doc", "original");
        let base = OpBaseline::of(&untouched, None);
        assert!(detect(&base, &local, &untouched, ConflictCheck::Checksum).is_none());
    }

    #[test]
    fn version_check_uses_metadata_counter() {
        let (mut local, mut remote, mut baseline) = pair();
        baseline.version = Some(3);
        remote
            .metadata
            .extra
            .insert("version".into(), serde_json::json!(4));
        assert!(detect(&baseline, &local, &remote, ConflictCheck::Version).is_some());

        remote
            .metadata
            .extra
            .insert("version".into(), serde_json::json!(3));
        assert!(detect(&baseline, &local, &remote, ConflictCheck::Version).is_none());
        local.touch();
    }

    #[test]
    fn hierarchy_conflicts_are_classified() {
        let base = Chunk::new("doc", "same");
        let mut local = base.clone();
        let mut remote = base;
        local.parent = Some(uuid::Uuid::new_v4());
        remote.parent = Some(uuid::Uuid::new_v4());
        assert_eq!(classify(&local, &remote), ConflictType::Hierarchy);
    }

    #[test]
    fn merge_concatenates_content_and_unions_tags() {
        let (mut local, mut remote, _) = pair();
        let tag_a = uuid::Uuid::new_v4();
        let tag_b = uuid::Uuid::new_v4();
        local.tags.insert(tag_a);
        remote.tags.insert(tag_b);
        remote
            .metadata
            .extra
            .insert("remote_only".into(), serde_json::json!(true));
        local
            .metadata
            .extra
            .insert("shared".into(), serde_json::json!("local"));
        remote
            .metadata
            .extra
            .insert("shared".into(), serde_json::json!("remote"));

        let merged = merge_chunks(&local, &remote);
        assert_eq!(merged.contents, "local edit\n---\nremote edit");
        assert!(merged.tags.contains(&tag_a) && merged.tags.contains(&tag_b));
        assert_eq!(merged.metadata.extra["shared"], serde_json::json!("local"));
        assert_eq!(
            merged.metadata.extra["remote_only"],
            serde_json::json!(true)
        );
    }
}
