//! Tracing setup for binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVE: &str =
    "orchestrator=info,coordinator=info,checkpoint=info,resource=warn,runtime_core=info";

/// Filter from `RUNTIME_LOG`, then `RUST_LOG`, then the default directive
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("RUNTIME_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber; later calls are ignored
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}
