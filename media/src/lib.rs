pub mod batch;
pub mod blob;
pub mod library;
pub mod vision;

pub use batch::{BatchItemFailure, BatchProcessor, BatchProgress, BatchReport, UploadTask};
pub use blob::{BlobStore, InMemoryBlobStore};
pub use library::{MediaItem, MediaLibrary, MediaListing, UploadOptions, UploadOutcome};
pub use vision::{HashingImageEmbedder, ImageEmbedder, MockVisionService, VisionService};
