pub mod embedding;
pub mod frontmatter;
pub mod parser;
pub mod pipeline;
pub mod synthesize;

pub use embedding::{token_embedding, HashingTextEmbedder, TextEmbedder};
pub use frontmatter::Frontmatter;
pub use parser::{Parser, ParserConfig};
pub use pipeline::{EmbedJob, EmbedService, EmbedWorker, IngestReport, IngestionPipeline};
pub use synthesize::{synthesize, ProposedChunk};
