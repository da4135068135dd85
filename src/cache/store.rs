//! Report cache storage.
//!
//! One entry per report, each stamped with its insertion instant. Expiry is
//! passive: an entry older than the TTL is reported as expired on lookup and
//! replaced by the next write.

use std::{collections::HashMap, sync::RwLock, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

use crate::domain::reports::{ReportData, ReportName};

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Result of looking a report up in the store.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(ReportData),
    Expired,
    Missing,
}

/// Lifecycle state of a stored report as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Missing,
    Cached,
    Expired,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub state: EntryState,
    pub age: Option<Duration>,
    pub rows: Option<usize>,
}

struct CacheEntry {
    data: ReportData,
    inserted_at: Instant,
}

/// In-memory report store with a fixed TTL.
pub struct ReportStore {
    entries: RwLock<HashMap<ReportName, CacheEntry>>,
    ttl: Duration,
}

impl ReportStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.ttl())
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn lookup(&self, report: ReportName) -> Lookup {
        let entries = rw_read(&self.entries, SOURCE, "lookup");
        match entries.get(&report) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Lookup::Fresh(entry.data.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        }
    }

    /// Store `data` for `report` if `open` holds while the write lock is held,
    /// replacing any previous entry.
    ///
    /// Returns whether the entry was written. A concurrent `clear` either
    /// precedes the check or removes the entry afterwards.
    pub fn insert_if(
        &self,
        report: ReportName,
        data: ReportData,
        open: impl FnOnce() -> bool,
    ) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "insert");
        if !open() {
            return false;
        }
        entries.insert(
            report,
            CacheEntry {
                data,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop the entry for `report`; returns whether one existed.
    pub fn invalidate(&self, report: ReportName) -> bool {
        rw_write(&self.entries, SOURCE, "invalidate")
            .remove(&report)
            .is_some()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_info(&self, report: ReportName) -> EntryInfo {
        let entries = rw_read(&self.entries, SOURCE, "entry_info");
        match entries.get(&report) {
            Some(entry) => {
                let age = entry.inserted_at.elapsed();
                EntryInfo {
                    state: if age < self.ttl {
                        EntryState::Cached
                    } else {
                        EntryState::Expired
                    },
                    age: Some(age),
                    rows: Some(entry.data.len()),
                }
            }
            None => EntryInfo {
                state: EntryState::Missing,
                age: None,
                rows: None,
            },
        }
    }
}
