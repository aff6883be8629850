//! Sluice - client-side fixed-window throttling
//!
//! This crate defers arbitrary callables so that at most a fixed number run
//! within each recurring window, letting an application respect an external
//! rate limit without tracking time or quota itself. A [`Limiter`] owns one
//! window and its backlog; a [`Registry`] runs several independently
//! windowed limiters under string labels and starts each one lazily.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use crate::config::{LimiterConfig, SluiceConfig, WindowConfig};
pub use crate::error::{Result, SluiceError};
pub use crate::ratelimit::{Limiter, LimiterStats, Registry};

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
