//! Work queue policy settings.

use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable retry and capacity policy for one work queue.
///
/// Built through [`WorkQueueSettings::builder`]; invalid combinations are
/// rejected by [`WorkQueueSettingsBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueSettings {
    max_events: u64,
    retry_interval: Duration,
    retry_discard_age: Duration,
    idle_poll_interval: Duration,
    storage_backoff: Duration,
    shutdown_timeout: Duration,
}

impl WorkQueueSettings {
    pub fn builder() -> WorkQueueSettingsBuilder {
        WorkQueueSettingsBuilder::default()
    }

    /// Shorthand for the three policy values, everything else defaulted.
    pub fn new(
        max_events: u64,
        retry_interval: Duration,
        retry_discard_age: Duration,
    ) -> Result<Self> {
        Self::builder()
            .max_events(max_events)
            .retry_interval(retry_interval)
            .retry_discard_age(retry_discard_age)
            .build()
    }

    /// Queue depth at which `submit` starts dropping.
    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Pause after a `Retry` outcome before the head is tried again.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// An item older than this is discarded instead of retried.
    pub fn retry_discard_age(&self) -> Duration {
        self.retry_discard_age
    }

    /// Fallback wake-up while the queue is empty. Each tick re-derives the
    /// deque's bounds, so items another instance or process wrote to the
    /// partition are picked up within this interval.
    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    /// Pause after a storage error in the consumer loop.
    pub fn storage_backoff(&self) -> Duration {
        self.storage_backoff
    }

    /// How long `close()` waits for the current item before aborting.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl Default for WorkQueueSettings {
    fn default() -> Self {
        Self {
            max_events: 1000,
            retry_interval: Duration::from_secs(30),
            retry_discard_age: Duration::from_secs(60 * 60),
            idle_poll_interval: Duration::from_secs(5),
            storage_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for [`WorkQueueSettings`]. Starts from the defaults.
#[derive(Debug, Clone, Default)]
pub struct WorkQueueSettingsBuilder {
    settings: WorkQueueSettings,
}

impl WorkQueueSettingsBuilder {
    pub fn max_events(mut self, n: u64) -> Self {
        self.settings.max_events = n;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.settings.retry_interval = interval;
        self
    }

    pub fn retry_discard_age(mut self, age: Duration) -> Self {
        self.settings.retry_discard_age = age;
        self
    }

    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.idle_poll_interval = interval;
        self
    }

    pub fn storage_backoff(mut self, backoff: Duration) -> Self {
        self.settings.storage_backoff = backoff;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<WorkQueueSettings> {
        let s = self.settings;
        if s.max_events == 0 {
            return Err(Error::InvalidSettings(
                "max_events must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("idle_poll_interval", s.idle_poll_interval),
            ("storage_backoff", s.storage_backoff),
            ("shutdown_timeout", s.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidSettings(format!("{name} must be non-zero")));
            }
        }
        Ok(s)
    }
}
