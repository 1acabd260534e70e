use media::BlobStore;
use notemesh_core::error::GatewayResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{ChunkStore, VectorIndex};
use sync::RemoteStore;
use tokio::time::timeout;

const PING_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

/// C9 health: liveness is "the process answers"; readiness requires the
/// required downstreams (chunk store, vector index) to answer a ping within
/// a short timeout; the full report also pings optional downstreams, which
/// can only degrade, never fail readiness.
pub struct HealthChecker {
    store: Arc<ChunkStore>,
    vectors: Arc<dyn VectorIndex>,
    remote: Arc<dyn RemoteStore>,
    blob: Arc<dyn BlobStore>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<ChunkStore>,
        vectors: Arc<dyn VectorIndex>,
        remote: Arc<dyn RemoteStore>,
        blob: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            store,
            vectors,
            remote,
            blob,
        }
    }

    pub fn liveness(&self) -> bool {
        true
    }

    pub async fn readiness(&self) -> bool {
        let store = ping_component("chunk_store", true, async {
            self.store.ping().await.map(|_| ())
        })
        .await;
        let vectors = ping_component("vector_index", true, self.vectors.ping()).await;
        store.status == HealthStatus::Healthy && vectors.status == HealthStatus::Healthy
    }

    pub async fn health(&self) -> HealthReport {
        let components = vec![
            ping_component("chunk_store", true, async {
                self.store.ping().await.map(|_| ())
            })
            .await,
            ping_component("vector_index", true, self.vectors.ping()).await,
            ping_component("remote_store", false, self.remote.ping()).await,
            ping_component("blob_store", false, self.blob.ping()).await,
        ];

        let required_down = components
            .iter()
            .any(|c| c.required && c.status != HealthStatus::Healthy);
        let optional_down = components
            .iter()
            .any(|c| !c.required && c.status != HealthStatus::Healthy);

        let status = if required_down {
            HealthStatus::Unhealthy
        } else if optional_down {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, components }
    }
}

async fn ping_component<F>(name: &str, required: bool, ping: F) -> ComponentHealth
where
    F: std::future::Future<Output = GatewayResult<()>>,
{
    let start = Instant::now();
    let (status, detail) = match timeout(PING_TIMEOUT, ping).await {
        Ok(Ok(())) => (HealthStatus::Healthy, None),
        Ok(Err(err)) => (HealthStatus::Unhealthy, Some(err.to_string())),
        Err(_) => (
            HealthStatus::Unhealthy,
            Some("ping deadline exceeded".to_string()),
        ),
    };
    ComponentHealth {
        name: name.to_string(),
        status,
        latency_ms: start.elapsed().as_millis() as u64,
        required,
        detail,
    }
}
