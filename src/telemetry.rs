use crate::error::ApiError;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber, writing to stderr so stdout stays machine-readable.
pub fn init_tracing(default_level: &str) -> Result<(), ApiError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| ApiError::Config(format!("failed to install tracing subscriber: {err}")))
}
