pub mod store;
pub mod vector;

pub use notemesh_core::model::CascadeMode;
pub use store::{
    render_document, ChunkStore, DeleteOutcome, DocumentPage, TagFilters, TagLogic,
    MAX_ANCESTOR_DEPTH,
};
pub use vector::{cosine_similarity, InMemoryVectorIndex, KnnFilter, VectorIndex, VectorMeta};
