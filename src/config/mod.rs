//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The Redis URL may carry credentials, so it is wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

/// Namespace prefix used for every store key when none is configured.
pub const DEFAULT_NAMESPACE: &str = "rmq";

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub namespace: String,
    pub prefetch_limit: usize,
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: SecretString::from(required_var("RMQ_REDIS_URL")?),
            namespace: std::env::var("RMQ_NAMESPACE")
                .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string()),
            prefetch_limit: parsed_var("RMQ_PREFETCH_LIMIT", 10)?,
            poll_interval: Duration::from_millis(parsed_var("RMQ_POLL_INTERVAL_MS", 1000)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Consumption options derived from this configuration.
    pub fn consume_options(&self) -> crate::queue::ConsumeOptions {
        crate::queue::ConsumeOptions {
            prefetch_limit: self.prefetch_limit,
            poll_interval: self.poll_interval,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name}: {raw:?} ({e})"))),
        Err(_) => Ok(default),
    }
}
