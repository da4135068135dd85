//! Cache configuration.
//!
//! Controls the report cache via the `[cache]` section of `h1b-insights.toml`.

use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_QUERY_TIMEOUT_SECONDS: u64 = 30;

/// Report cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reports from the in-memory store. When off, every read hits the database.
    pub enabled: bool,
    /// Lifetime of a cache entry, measured from its last write.
    pub ttl_seconds: u64,
    /// Upper bound on a single report computation.
    pub query_timeout_seconds: u64,
    /// Compute every report when the server starts.
    pub warm_on_startup: bool,
    /// Re-warm every report on this cadence; zero disables the schedule.
    pub refresh_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            query_timeout_seconds: DEFAULT_QUERY_TIMEOUT_SECONDS,
            warm_on_startup: true,
            refresh_interval_seconds: 0,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            ttl_seconds: settings.ttl.as_secs(),
            query_timeout_seconds: settings.query_timeout.as_secs(),
            warm_on_startup: settings.warm_on_startup,
            refresh_interval_seconds: settings
                .refresh_interval
                .map(|interval| interval.as_secs())
                .unwrap_or(0),
        }
    }
}

impl CacheConfig {
    /// Entry lifetime, clamped to at least one second.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.max(1))
    }

    /// Computation timeout, clamped to at least one second.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds.max(1))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_seconds > 0)
            .then(|| Duration::from_secs(self.refresh_interval_seconds))
    }
}
