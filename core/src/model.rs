use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Stable 128-bit chunk identifier. Assigned at creation, never reused.
pub type ChunkId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentScope {
    #[default]
    File,
    Virtual,
    Synthetic,
}

/// What happens to a deleted chunk's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    /// Children are re-parented to the deleted chunk's parent (default).
    Reparent,
    /// The whole subtree is deleted.
    Subtree,
}

/// Structural block kind, recorded as a metadata hint so the ingestion diff
/// can match chunks of the same shape across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Heading,
    Paragraph,
    ListItem,
    CodeBlock,
    Blockquote,
}

/// Role flags. All may be false for a plain content chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkFlags {
    #[serde(default)]
    pub is_page: bool,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_slot: bool,
    #[serde(default)]
    pub is_image: bool,
}

impl ChunkFlags {
    pub fn page() -> Self {
        Self {
            is_page: true,
            ..Self::default()
        }
    }

    pub fn tag() -> Self {
        Self {
            is_tag: true,
            ..Self::default()
        }
    }

    pub fn image() -> Self {
        Self {
            is_image: true,
            ..Self::default()
        }
    }
}

/// Source location of a chunk within its originating document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub source_id: String,
    pub line_start: u32,
    pub line_end: u32,
    pub char_start: usize,
    pub char_end: usize,
}

impl Position {
    /// Total order used for position-sorted document reads (invariant 5).
    pub fn sort_key(&self) -> (u32, usize) {
        (self.line_start, self.char_start)
    }
}

/// Typed metadata: well-known keys as fields, everything else in an
/// insertion-ordered passthrough bag of JSON values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css_classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_indent: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.tags.is_empty()
            && self.aliases.is_empty()
            && self.css_classes.is_empty()
            && self.created.is_none()
            && self.modified.is_none()
            && self.heading_level.is_none()
            && self.list_indent.is_none()
            && self.block.is_none()
            && self.code_language.is_none()
            && self.extra.is_empty()
    }
}

/// Handle to the current embedding of a chunk in the external vector index.
/// `contents_hash` records the exact contents the vector was produced from,
/// so staleness is detectable (invariant 6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRef {
    pub model_id: String,
    pub dimension: usize,
    pub contents_hash: String,
}

/// Handle from a chunk to its media record, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub key: String,
    pub mime_type: String,
}

/// AI analysis of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub description: String,
    pub tags: Vec<String>,
    pub confidence: f32,
}

/// Media record for an image chunk: blob location, content hash, optional
/// analysis and image embedding handle. Blob bytes live in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub key: String,
    pub mime_type: String,
    pub url: String,
    pub size_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ImageAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_embedding: Option<EmbeddingRef>,
    pub created_time: DateTime<Utc>,
}

/// The unified record for every addressable unit of knowledge: pages,
/// headings, paragraphs, bullets, tags, templates, slots, and images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub contents: String,
    /// Structural parent; forms a forest, never a DAG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ChunkId>,
    /// Denormalized page root for O(1) page-scoped queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<ChunkId>,
    /// Non-owning reference; may form cycles, never traversed for ownership.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<ChunkId>,
    #[serde(default)]
    pub flags: ChunkFlags,
    /// Ids of chunks with `is_tag = true`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<ChunkId>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub document_id: String,
    #[serde(default)]
    pub document_scope: DocumentScope,
    pub created_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_ref: Option<EmbeddingRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<MediaRef>,
}

impl Chunk {
    /// A fresh content chunk in the given document.
    pub fn new(document_id: impl Into<String>, contents: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            chunk_id: Uuid::new_v4(),
            contents: contents.into(),
            parent: None,
            page: None,
            ref_id: None,
            flags: ChunkFlags::default(),
            tags: BTreeSet::new(),
            metadata: ChunkMetadata::default(),
            position: None,
            document_id: document_id.into(),
            document_scope: DocumentScope::File,
            created_time: now,
            last_updated: now,
            embedding_ref: None,
            media_ref: None,
        }
    }

    /// A page root: `parent = nil`, `page = self` (invariant 4).
    pub fn new_page(document_id: impl Into<String>, title: impl Into<String>) -> Self {
        let mut chunk = Self::new(document_id, "");
        chunk.flags = ChunkFlags::page();
        chunk.page = Some(chunk.chunk_id);
        chunk.metadata.title = Some(title.into());
        chunk
    }

    /// A tag chunk named by its contents.
    pub fn new_tag(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut chunk = Self::new(format!("tag:{name}"), name);
        chunk.document_scope = DocumentScope::Synthetic;
        chunk.flags = ChunkFlags::tag();
        chunk
    }

    pub fn with_parent(mut self, parent: ChunkId, page: Option<ChunkId>) -> Self {
        self.parent = Some(parent);
        self.page = page;
        self
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// SHA-256 of the exact contents; used for embedding currency and
    /// checksum-based conflict detection.
    pub fn contents_hash(&self) -> String {
        sha256_hex(self.contents.as_bytes())
    }

    /// Hash of whitespace-normalized contents, used by the ingestion diff.
    pub fn normalized_contents_hash(&self) -> String {
        let normalized = normalize_whitespace(&self.contents);
        sha256_hex(normalized.as_bytes())
    }

    pub fn block_kind(&self) -> Option<BlockKind> {
        self.metadata.block
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
