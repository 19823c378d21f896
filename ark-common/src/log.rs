//! Logging Infrastructure
//!
//! The crate logs through `tracing` events. This module installs the
//! process-wide `tracing_subscriber` formatter used by embedders that do not
//! bring their own subscriber.
//!
//! The filter comes from the `ARK_LOG` environment variable when it holds a
//! valid `EnvFilter` directive (for example `ark_common::heap=debug`), and
//! from the configured [`LogLevel`] otherwise.
//!
//! # Example
//!
//! ```rust,ignore
//! use ark_common::config::LogConfig;
//!
//! ark_common::log::init(&LogConfig::default());
//! tracing::info!("heap ready");
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_FILTER_ENV: &str = "ARK_LOG";

/// Map a configured level onto a tracing level filter.
pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already set, in which case the
/// existing one is kept.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_thread_names(config.thread_names)
        .with_target(config.targets)
        .try_init()
        .is_ok()
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(LogLevel::Debug))
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
