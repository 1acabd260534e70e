pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod op;
pub mod retry;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. The filter comes from
/// `NOTEMESH_LOG`, falling back to `RUST_LOG`, then `info`. Later calls are
/// no-ops, so every composition root (and test) can call this unconditionally.
pub fn init_tracing() {
    let filter_layer = EnvFilter::try_from_env("NOTEMESH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}
