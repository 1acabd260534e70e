use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8087,
            cors_allowed_origins: vec!["app://notemesh".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// Enables the materialized tag-inheritance closure (written at mutation
    /// time, never computed on read).
    pub tag_inheritance: bool,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tag_inheritance: false,
            read_timeout_ms: 5_000,
            write_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub spaces_per_indent: usize,
    /// Auto-create tag chunks for unresolved inline #tags.
    pub auto_create_tags: bool,
    pub embedding_model_id: String,
    pub embedding_dimension: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            spaces_per_indent: 2,
            auto_create_tags: true,
            embedding_model_id: "text-embed-v1".into(),
            embedding_dimension: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncSettings {
    pub strategy: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub sync_interval_ms: u64,
    pub max_queue_size: usize,
    pub max_retry_attempts: u32,
    pub max_concurrent_operations: usize,
    pub conflict_check: String,
    pub resolution: String,
    pub persist_dir: Option<String>,
    pub snapshot_every_ops: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            strategy: "batched".into(),
            batch_size: 32,
            batch_timeout_ms: 2_000,
            sync_interval_ms: 30_000,
            max_queue_size: 10_000,
            max_retry_attempts: 5,
            max_concurrent_operations: 4,
            conflict_check: "timestamp".into(),
            resolution: "remote_wins".into(),
            persist_dir: None,
            snapshot_every_ops: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Weight of the semantic score in hybrid fusion.
    pub hybrid_alpha: f32,
    pub slow_query_threshold_ms: u64,
    /// Cap on user content echoed into slow-query logs.
    pub slow_query_payload_cap: usize,
    pub fulltext_fallback: bool,
    pub duplicate_image_threshold: f32,
    pub slide_similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 200,
            hybrid_alpha: 0.7,
            slow_query_threshold_ms: 500,
            slow_query_payload_cap: 256,
            fulltext_fallback: true,
            duplicate_image_threshold: 0.98,
            slide_similarity_threshold: 0.85,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub search_max_entries: usize,
    pub search_max_bytes: usize,
    pub search_ttl_ms: u64,
    pub content_max_entries: usize,
    pub content_max_bytes: usize,
    pub content_ttl_ms: u64,
    pub api_max_entries: usize,
    pub api_max_bytes: usize,
    pub api_ttl_ms: u64,
    pub global_memory_limit: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            search_max_entries: 512,
            search_max_bytes: 8 * 1024 * 1024,
            search_ttl_ms: 60_000,
            content_max_entries: 256,
            content_max_bytes: 32 * 1024 * 1024,
            content_ttl_ms: 300_000,
            api_max_entries: 512,
            api_max_bytes: 4 * 1024 * 1024,
            api_ttl_ms: 30_000,
            global_memory_limit: 64 * 1024 * 1024,
            cleanup_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub concurrency: usize,
    pub upload_timeout_ms: u64,
    pub analyze_on_upload: bool,
    pub embed_on_upload: bool,
    pub image_embedding_model_id: String,
    pub image_embedding_dimension: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            upload_timeout_ms: 60_000,
            analyze_on_upload: true,
            embed_on_upload: true,
            image_embedding_model_id: "image-embed-v1".into(),
            image_embedding_dimension: 128,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_ms: u64,
    pub breaker_max_requests: u32,
    pub embed_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            factor: 2.0,
            jitter: true,
            breaker_failure_threshold: 5,
            breaker_reset_timeout_ms: 30_000,
            breaker_max_requests: 1,
            embed_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ingestion: IngestionConfig,
    pub sync: SyncSettings,
    pub retrieval: RetrievalConfig,
    pub cache: CacheSettings,
    pub media: MediaConfig,
    pub resilience: ResilienceConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("NOTEMESH").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_contracts() {
        let config = AppConfig::default();
        assert_eq!(config.media.concurrency, 3);
        assert!((config.retrieval.hybrid_alpha - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.store.read_timeout_ms, 5_000);
        assert_eq!(config.store.write_timeout_ms, 10_000);
        assert_eq!(config.resilience.embed_timeout_ms, 30_000);
        assert_eq!(config.media.upload_timeout_ms, 60_000);
    }
}
