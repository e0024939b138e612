//! Tracing subscriber setup driven by [`LoggingConfig`].
//!
//! The library only emits `tracing` events; embedding applications call
//! [`init_tracing`] once at startup (or install their own subscriber).

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{IvfSqError, Result};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes priority over `config.level`. `config.format` selects
/// `"json"` output; anything else falls back to human-readable text.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    installed.map_err(|e| IvfSqError::Config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_config_error() {
        let config = LoggingConfig {
            level: "warn".into(),
            format: "json".into(),
        };
        let _ = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(matches!(second, Err(IvfSqError::Config(_))));
    }
}
