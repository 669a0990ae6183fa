//! Tracing subscriber bootstrap for processes embedding the bridge.

use crate::config::LoggingConfig;
use crate::errors::{BridgeError, BridgeResult};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` directives plus the configured level.
pub fn build_filter(config: &LoggingConfig) -> BridgeResult<EnvFilter> {
    let directive = config
        .level
        .parse::<Directive>()
        .map_err(|e| BridgeError::Config(format!("Invalid log level {:?}: {}", config.level, e)))?;
    Ok(EnvFilter::from_default_env().add_directive(directive))
}

/// Install the global subscriber. Calling this more than once is harmless;
/// only the first call takes effect.
pub fn init_tracing(config: &LoggingConfig) -> BridgeResult<()> {
    let filter = build_filter(config)?;

    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
