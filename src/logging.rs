//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single module can
//! be turned up without editing the settings file:
//!
//! ```text
//! RUST_LOG=spectro_daq::camera=trace spectro acquire
//! ```

use crate::config::{ApplicationConfig, LogFormat};
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &ApplicationConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| anyhow!("invalid log filter '{}': {e}", config.log_level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match config.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(
        app = %config.name,
        level = %config.log_level,
        format = ?config.log_format,
        "Logging initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = ApplicationConfig::default();
        // Another test may have installed a subscriber first
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
