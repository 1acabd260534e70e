use bytes::Bytes;
use chrono::{DateTime, Utc};
use notemesh_core::model::{ChunkId, DocumentScope};
use serde::{Deserialize, Serialize};
use storage::TagLogic;
use thiserror::Error;

const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_scope: Option<DocumentScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub query: String,
    #[serde(default)]
    pub tags: Vec<ChunkId>,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagQuery {
    pub tags: Vec<ChunkId>,
    #[serde(default = "default_tag_logic")]
    pub logic: TagLogic,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextQuery {
    pub query: String,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridQuery {
    pub query: String,
    #[serde(default)]
    pub tags: Vec<ChunkId>,
    /// Weight of the semantic score; tag score gets `1 - alpha`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Either fresh image bytes or a stored image chunk.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes(Bytes),
    Chunk(ChunkId),
}

#[derive(Debug, Clone)]
pub struct ImageSimilarityQuery {
    pub source: ImageSource,
    pub tags: Vec<ChunkId>,
    pub document_id: Option<String>,
    pub limit: usize,
    /// Drop hits scoring below this.
    pub threshold: Option<f32>,
}

impl ImageSimilarityQuery {
    pub fn for_bytes(bytes: Bytes) -> Self {
        Self {
            source: ImageSource::Bytes(bytes),
            tags: Vec::new(),
            document_id: None,
            limit: DEFAULT_LIMIT,
            threshold: None,
        }
    }

    pub fn for_chunk(chunk_id: ChunkId) -> Self {
        Self {
            source: ImageSource::Chunk(chunk_id),
            tags: Vec::new(),
            document_id: None,
            limit: DEFAULT_LIMIT,
            threshold: None,
        }
    }
}

const fn default_limit() -> usize {
    DEFAULT_LIMIT
}

const fn default_tag_logic() -> TagLogic {
    TagLogic::And
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryValidationError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("limit must be between 1 and {0}")]
    InvalidLimit(usize),
    #[error("alpha must be within [0, 1]")]
    InvalidAlpha,
    #[error("tag list must not be empty")]
    EmptyTags,
    #[error("malformed cursor")]
    BadCursor,
    #[error("updated_after must be <= updated_before")]
    InvalidDateRange,
}

fn validate_limit(limit: usize) -> Result<(), QueryValidationError> {
    if limit == 0 || limit > MAX_LIMIT {
        return Err(QueryValidationError::InvalidLimit(MAX_LIMIT));
    }
    Ok(())
}

fn validate_filters(filters: &QueryFilters) -> Result<(), QueryValidationError> {
    if let (Some(after), Some(before)) = (filters.updated_after, filters.updated_before) {
        if after > before {
            return Err(QueryValidationError::InvalidDateRange);
        }
    }
    Ok(())
}

impl SemanticQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tags: Vec::new(),
            filters: QueryFilters::default(),
            limit: DEFAULT_LIMIT,
            cursor: None,
        }
    }

    pub fn validate(&self) -> Result<(), QueryValidationError> {
        if self.query.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuery);
        }
        validate_limit(self.limit)?;
        validate_filters(&self.filters)
    }
}

impl TagQuery {
    pub fn new(tags: Vec<ChunkId>, logic: TagLogic) -> Self {
        Self {
            tags,
            logic,
            filters: QueryFilters::default(),
            limit: DEFAULT_LIMIT,
            cursor: None,
        }
    }

    pub fn validate(&self) -> Result<(), QueryValidationError> {
        if self.tags.is_empty() {
            return Err(QueryValidationError::EmptyTags);
        }
        validate_limit(self.limit)?;
        validate_filters(&self.filters)
    }
}

impl FulltextQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: QueryFilters::default(),
            limit: DEFAULT_LIMIT,
            cursor: None,
        }
    }

    pub fn validate(&self) -> Result<(), QueryValidationError> {
        if self.query.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuery);
        }
        validate_limit(self.limit)?;
        validate_filters(&self.filters)
    }
}

impl HybridQuery {
    pub fn new(query: impl Into<String>, tags: Vec<ChunkId>) -> Self {
        Self {
            query: query.into(),
            tags,
            alpha: None,
            filters: QueryFilters::default(),
            limit: DEFAULT_LIMIT,
            cursor: None,
        }
    }

    pub fn validate(&self) -> Result<(), QueryValidationError> {
        if self.query.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuery);
        }
        if let Some(alpha) = self.alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(QueryValidationError::InvalidAlpha);
            }
        }
        validate_limit(self.limit)?;
        validate_filters(&self.filters)
    }
}

impl ImageSimilarityQuery {
    pub fn validate(&self) -> Result<(), QueryValidationError> {
        validate_limit(self.limit)
    }
}
