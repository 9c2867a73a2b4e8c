//! Shared tracing setup for baton binaries.

pub mod logging;

pub use logging::{LogConfig, LogFormat};

/// Initialize process-wide logging from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    logging::init(LogConfig::from_env());
}
