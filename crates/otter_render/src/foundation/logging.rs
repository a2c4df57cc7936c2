//! Logging utilities and structured logging support

pub use log::{debug, info, warn, error, trace};

use crate::core::config::LogConfig;

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    // A second initialisation (tests, embedding apps) is harmless
    let _ = env_logger::try_init();
}

/// Initialize logging with the configured default filter
///
/// `RUST_LOG` still takes precedence when it is set.
pub fn init_with_config(config: &LogConfig) {
    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
