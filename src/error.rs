//! Error types for sluice.

use thiserror::Error;

/// Main error type for limiter and registry operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Window configuration missing or malformed
    #[error("Invalid window configuration: {0}")]
    InvalidConfiguration(String),

    /// A limiter with this label is already registered
    #[error("Limiter with label '{0}' already exists")]
    DuplicateLabel(String),

    /// No limiter is registered under this label
    #[error("Limiter with label '{0}' missing")]
    UnknownLabel(String),

    /// The recurring window timer could not be created
    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    /// Limiter table could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
