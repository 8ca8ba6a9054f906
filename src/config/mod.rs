//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a variable is set but unparsable.

pub mod settings;

pub use settings::{WorkQueueSettings, WorkQueueSettingsBuilder};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    /// SQLite file holding every queue partition.
    pub db_path: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub queue: WorkQueueSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let mut queue = WorkQueueSettings::builder();
        if let Some(n) = parsed_var::<u64>("WORKQ_MAX_EVENTS")? {
            queue = queue.max_events(n);
        }
        if let Some(ms) = parsed_var::<u64>("WORKQ_RETRY_INTERVAL_MS")? {
            queue = queue.retry_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = parsed_var::<u64>("WORKQ_RETRY_DISCARD_AGE_SECS")? {
            queue = queue.retry_discard_age(Duration::from_secs(secs));
        }

        Ok(Self {
            db_path: std::env::var("WORKQ_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("workq.db")),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue: queue.build()?,
        })
    }
}

fn parsed_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
