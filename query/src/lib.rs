pub mod engine;
pub mod request;

pub use engine::{RetrievalEngine, SearchHit, SearchPage};
pub use request::{
    FulltextQuery, HybridQuery, ImageSimilarityQuery, ImageSource, QueryFilters,
    QueryValidationError, SemanticQuery, TagQuery, MAX_LIMIT,
};
