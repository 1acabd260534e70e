pub mod api;
pub mod health;
pub mod service;

pub use api::{
    BatchItemStatus, ChunkPatch, ErrorBody, ErrorEnvelope, MediaUploadResponse, MetricsResponse,
    MoveRequest,
};
pub use health::{ComponentHealth, HealthChecker, HealthReport, HealthStatus};
pub use service::{GatewayDeps, GatewayService};
