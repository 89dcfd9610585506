//! Tracing subscriber setup
//!
//! The broker core only emits `tracing` events. Embedders that do not
//! install their own subscriber can call [`init`] with the `[log]` section
//! of the configuration.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Build the filter: `RUST_LOG` wins over the configured level
fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber.
///
/// Returns false if a global subscriber was already set.
pub fn init(config: &LogConfig) -> bool {
    let builder = fmt()
        .with_env_filter(filter(config))
        .with_target(false)
        .with_thread_ids(config.thread_ids)
        .with_file(false)
        .with_line_number(false);

    let result = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Full => builder.try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LogConfig {
            level: "tinymq=debug".to_string(),
            ..Default::default()
        };
        // The first call may lose against another test's subscriber
        let _ = init(&config);
        assert!(!init(&config));
    }

    #[test]
    fn bad_directive_falls_back() {
        let config = LogConfig {
            level: "[[not a filter".to_string(),
            ..Default::default()
        };
        let _ = filter(&config);
    }
}
