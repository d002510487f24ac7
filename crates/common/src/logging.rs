//! Tracing subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logger configuration for a process.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    base_name: String,
    json: bool,
}

impl LoggerConfig {
    /// Human-readable output with the given service name.
    pub fn with_base_name(name: &str) -> Self {
        Self {
            base_name: name.to_owned(),
            json: false,
        }
    }

    /// Switches to newline-delimited JSON output.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Initializes the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Must be called once,
/// early in `main`; repeated calls panic.
pub fn init(config: LoggerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    tracing::info!(service = %config.base_name, "logging initialized");
}
