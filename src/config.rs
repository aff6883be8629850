//! Window configuration for limiters and labeled limiter tables.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SluiceError};

/// Prefix for environment overrides applied on top of a limiter table file.
const ENV_PREFIX: &str = "SLUICE";
/// Separator between nested keys in environment overrides.
const ENV_SEPARATOR: &str = "__";
/// Largest window size; stats report remaining quota as an `i64`.
const MAX_WINDOW_SIZE: u64 = i64::MAX as u64;

/// A fixed-length window admitting at most `size` executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowConfig {
    /// Maximum callables executed per window
    pub size: u64,
    /// Window duration in milliseconds
    pub length: u64,
}

impl WindowConfig {
    /// Get the duration of one window.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.length)
    }
}

/// Configuration for a single limiter.
///
/// Every deserialization path goes through [`LimiterConfig::from_value`],
/// so a config read from YAML, JSON or a file is checked the same way as
/// one built by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub struct LimiterConfig {
    /// The window this limiter enforces
    pub window: WindowConfig,
}

impl LimiterConfig {
    /// Create a config for `size` executions every `length_ms` milliseconds.
    pub fn new(size: u64, length_ms: u64) -> Result<Self> {
        let config = Self {
            window: WindowConfig {
                size,
                length: length_ms,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a config from an untyped value shaped like
    /// `{ "window": { "size": <int>, "length": <int> } }`.
    pub fn from_value(value: Value) -> Result<Self> {
        let window = value
            .get("window")
            .ok_or_else(|| invalid("window is missing"))?
            .as_object()
            .ok_or_else(|| invalid("window must be an object"))?;

        let config = Self {
            window: WindowConfig {
                size: read_integer(window, "size")?,
                length: read_integer(window, "length")?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| invalid(format!("failed to parse JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse a config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|e| invalid(format!("failed to parse YAML: {}", e)))?;
        Self::from_value(value)
    }

    /// Check the invariants a limiter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.window.length == 0 {
            return Err(invalid("window.length must be greater than zero"));
        }
        if self.window.size > MAX_WINDOW_SIZE {
            return Err(invalid(format!(
                "window.size must be at most {}, got {}",
                MAX_WINDOW_SIZE, self.window.size
            )));
        }
        Ok(())
    }
}

impl TryFrom<Value> for LimiterConfig {
    type Error = SluiceError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

fn read_integer(window: &Map<String, Value>, field: &str) -> Result<u64> {
    match window.get(field) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            invalid(format!(
                "window.{} must be a non-negative integer, got {}",
                field, n
            ))
        }),
        Some(other) => Err(invalid(format!(
            "window.{} must be a number, got {}",
            field, other
        ))),
        None => Err(invalid(format!("window.{} is missing", field))),
    }
}

fn invalid(msg: impl Into<String>) -> SluiceError {
    SluiceError::InvalidConfiguration(msg.into())
}

/// A table of labeled limiters, as loaded by [`crate::ratelimit::Registry::from_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Limiter configs keyed by label
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,
}

impl SluiceConfig {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a limiter table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SluiceError::Config(format!("Failed to parse limiter table: {}", e)))
    }

    /// Load a limiter table from a file, with `SLUICE__...` environment
    /// overrides layered on top.
    ///
    /// The format is picked from the file extension. Keys pass through the
    /// `config` crate, so labels should be lowercase.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter table");

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SluiceError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| SluiceError::Config(format!("Failed to parse limiter table: {}", e)))
    }
}
