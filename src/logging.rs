//! Tracing subscriber setup.
//!
//! Logs always go to stderr; stdout carries the protocol and nothing else.
//!
//! ```bash
//! # Everything from the engine at debug, JSON lines
//! RUST_LOG=distroforge=debug DISTROFORGE_LOG_FORMAT=json distroforge-engine
//! ```

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn initialize(config: &LoggingConfig) -> Result<()> {
    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| anyhow!("invalid {}: {}", EnvFilter::DEFAULT_ENV, e))?,
        _ => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("invalid logging.level '{}': {}", config.level, e))?,
    };

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| anyhow!("installing tracing subscriber: {}", e))
}

/// Span wrapping the handling of one request.
pub fn request_span(method: &str, id: &serde_json::Value) -> tracing::Span {
    tracing::debug_span!("request", method = %method, id = %id)
}
