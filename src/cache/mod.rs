//! Report cache.
//!
//! Keeps the rows of every dashboard report in memory for a fixed TTL and
//! recomputes them on demand:
//!
//! - **Store**: one entry per report, expired passively on lookup
//! - **In-flight registry**: concurrent misses on one report share a single
//!   computation
//! - **Manager**: read-through fetch, warm-all, invalidation and shutdown
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `h1b-insights.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! ttl_seconds = 3600
//! query_timeout_seconds = 30
//! warm_on_startup = true
//! refresh_interval_seconds = 0
//! ```

mod config;
mod inflight;
mod lock;
mod manager;
mod store;

pub use config::CacheConfig;
pub use inflight::{Claim, ComputeResult, InFlightReports, PendingReport};
pub use manager::{CacheManager, ReportError, ReportStatus, WarmFailure, WarmSummary};
pub use store::{EntryInfo, EntryState, Lookup, ReportStore};
