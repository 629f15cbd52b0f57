//! Subscriber setup shared by the `jt` CLI and the HTTP service.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl LoggingConfig {
    #[must_use]
    pub fn new(level: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: format.into(),
        }
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Install the global subscriber. Events go to stderr so stdout stays
    /// machine-readable.
    ///
    /// # Errors
    /// Returns an error when the level is not a valid filter directive or a
    /// subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|err| anyhow!("invalid log level `{}`: {err}", self.level))?,
        };

        let installed = if self.is_json() {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
        } else {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
        };
        installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}
