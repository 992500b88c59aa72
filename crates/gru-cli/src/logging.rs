//! Console logging for the CLI.
//!
//! The library crates log through `log`; the subscriber's log bridge picks
//! those records up alongside the CLI's own `tracing` events.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize console logging. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let fallback = format!(
        "{lvl},gru_model={lvl},gru_kernels={lvl},gru_tensor={lvl}",
        lvl = default_level
    );
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
