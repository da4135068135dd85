//! Report cache manager.
//!
//! Mediates every read of a report: serves fresh entries from the store,
//! recomputes absent or expired ones against the [`ReportSource`], and shares
//! each recomputation with all callers that miss on the same report while it
//! runs.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{RepoError, ReportSource};
use crate::domain::reports::{ReportData, ReportName};

use super::config::CacheConfig;
use super::inflight::{Claim, ComputeResult, InFlightReports};
use super::store::{EntryState, Lookup, ReportStore};

const METRIC_CACHE_HIT: &str = "h1b_insights_report_cache_hit_total";
const METRIC_CACHE_MISS: &str = "h1b_insights_report_cache_miss_total";
const METRIC_COALESCED: &str = "h1b_insights_report_coalesced_total";
const METRIC_FAILURE: &str = "h1b_insights_report_failure_total";
const METRIC_QUERY_MS: &str = "h1b_insights_report_query_ms";
const METRIC_WARM_MS: &str = "h1b_insights_report_warm_ms";

/// Why a report could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("report `{report}` query failed: {message}")]
    Query { report: ReportName, message: String },
    #[error("report `{report}` timed out")]
    Timeout { report: ReportName },
    #[error("report `{report}` computation aborted: {message}")]
    Aborted { report: ReportName, message: String },
    #[error("report cache has been shut down")]
    ShutDown,
}

impl ReportError {
    fn from_repo(report: ReportName, err: RepoError) -> Self {
        match err {
            RepoError::Timeout => Self::Timeout { report },
            other => Self::Query {
                report,
                message: other.to_string(),
            },
        }
    }

    pub fn report(&self) -> Option<ReportName> {
        match self {
            ReportError::Query { report, .. }
            | ReportError::Timeout { report }
            | ReportError::Aborted { report, .. } => Some(*report),
            ReportError::ShutDown => None,
        }
    }
}

/// Operator view of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportStatus {
    pub report: ReportName,
    pub endpoint: &'static str,
    pub state: EntryState,
    pub age_seconds: Option<u64>,
    pub rows: Option<usize>,
    pub computing: bool,
    pub min_sample: u32,
    pub sample_unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmFailure {
    pub report: ReportName,
    pub error: String,
}

/// Outcome of [`CacheManager::warm_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmSummary {
    pub warmed: Vec<ReportName>,
    pub failed: Vec<WarmFailure>,
    pub elapsed_ms: u64,
}

impl WarmSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Read-through cache over the report catalog.
///
/// Owns its store and its report source. Construct one per process and hand
/// it to the HTTP layer behind an `Arc`.
pub struct CacheManager {
    config: CacheConfig,
    source: Arc<dyn ReportSource>,
    store: Arc<ReportStore>,
    inflight: InFlightReports,
    closed: Arc<AtomicBool>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, source: Arc<dyn ReportSource>) -> Self {
        let store = Arc::new(ReportStore::new(&config));
        Self {
            config,
            source,
            store,
            inflight: InFlightReports::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the rows for `report`, computing them when the cache has no
    /// fresh entry.
    pub async fn fetch(&self, report: ReportName) -> Result<ReportData, ReportError> {
        self.ensure_open()?;

        if !self.config.enabled {
            return run_query(self.source.as_ref(), report, self.config.query_timeout()).await;
        }

        match self.store.lookup(report) {
            Lookup::Fresh(data) => {
                counter!(METRIC_CACHE_HIT, "report" => report.as_str()).increment(1);
                return Ok(data);
            }
            Lookup::Expired | Lookup::Missing => {
                counter!(METRIC_CACHE_MISS, "report" => report.as_str()).increment(1);
            }
        }

        self.load(report, false).await
    }

    /// Like [`fetch`](Self::fetch), but a failure degrades to an empty result.
    pub async fn get(&self, report: ReportName) -> ReportData {
        match self.fetch(report).await {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    target = "h1b_insights::cache",
                    report = %report,
                    error = %err,
                    "serving empty report after failure"
                );
                ReportData::empty()
            }
        }
    }

    /// Recompute `report` whatever the state of its entry. A failed refresh
    /// keeps the previous entry.
    pub async fn refresh(&self, report: ReportName) -> Result<ReportData, ReportError> {
        self.ensure_open()?;

        if !self.config.enabled {
            return run_query(self.source.as_ref(), report, self.config.query_timeout()).await;
        }

        self.load(report, true).await
    }

    /// Refresh every report concurrently and wait until each has succeeded or
    /// failed. One failing report never stops the others.
    #[instrument(skip(self), fields(reports = ReportName::ALL.len()))]
    pub async fn warm_all(&self) -> WarmSummary {
        if !self.config.enabled {
            info!(
                target = "h1b_insights::cache",
                "report cache disabled; warm skipped"
            );
            return WarmSummary::default();
        }

        let started_at = Instant::now();
        info!(target = "h1b_insights::cache", "warming report cache");

        let outcomes = join_all(
            ReportName::ALL
                .into_iter()
                .map(|report| async move { (report, self.refresh(report).await) }),
        )
        .await;

        let mut summary = WarmSummary::default();
        for (report, outcome) in outcomes {
            match outcome {
                Ok(_) => summary.warmed.push(report),
                Err(err) => {
                    warn!(
                        target = "h1b_insights::cache",
                        report = %report,
                        error = %err,
                        "report failed to warm"
                    );
                    summary.failed.push(WarmFailure {
                        report,
                        error: err.to_string(),
                    });
                }
            }
        }

        let elapsed = started_at.elapsed();
        summary.elapsed_ms = elapsed.as_millis() as u64;
        histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);

        info!(
            target = "h1b_insights::cache",
            warmed = summary.warmed.len(),
            failed = summary.failed.len(),
            elapsed_ms = summary.elapsed_ms,
            "report cache warm complete"
        );

        summary
    }

    /// Drop the cached entry for `report`; returns whether one existed.
    pub fn invalidate(&self, report: ReportName) -> bool {
        let removed = self.store.invalidate(report);
        debug!(
            target = "h1b_insights::cache",
            report = %report,
            removed,
            "report invalidated"
        );
        removed
    }

    pub fn invalidate_all(&self) {
        self.store.clear();
        debug!(target = "h1b_insights::cache", "all reports invalidated");
    }

    pub fn status(&self) -> Vec<ReportStatus> {
        ReportName::ALL
            .into_iter()
            .map(|report| {
                let info = self.store.entry_info(report);
                ReportStatus {
                    report,
                    endpoint: report.endpoint(),
                    state: info.state,
                    age_seconds: info.age.map(|age| age.as_secs()),
                    rows: info.rows,
                    computing: self.inflight.is_running(report),
                    min_sample: report.min_sample(),
                    sample_unit: report.sample_unit(),
                }
            })
            .collect()
    }

    pub async fn health_check(&self) -> Result<(), RepoError> {
        self.source.health_check().await
    }

    /// Release the report source and clear the store. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(
                target = "h1b_insights::cache",
                "report cache already shut down"
            );
            return;
        }

        self.source.close().await;
        self.store.clear();
        info!(target = "h1b_insights::cache", "report cache shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ReportError> {
        if self.is_shut_down() {
            Err(ReportError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn load(&self, report: ReportName, force: bool) -> ComputeResult {
        match self.inflight.claim(report) {
            Claim::Joined(pending) => {
                counter!(METRIC_COALESCED, "report" => report.as_str()).increment(1);
                pending.await
            }
            Claim::Started { pending, sender } => {
                // Another computation may have stored the report between our
                // lookup and the claim.
                if !force && let Lookup::Fresh(data) = self.store.lookup(report) {
                    self.inflight.release(report);
                    let _ = sender.send(Ok(data.clone()));
                    return Ok(data);
                }

                self.spawn_computation(report, sender);
                pending.await
            }
        }
    }

    /// Run the computation on its own task so a cancelled caller does not
    /// cancel the work other callers are waiting on.
    fn spawn_computation(&self, report: ReportName, sender: oneshot::Sender<ComputeResult>) {
        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let closed = Arc::clone(&self.closed);
        let timeout = self.config.query_timeout();
        let slot = SlotGuard {
            report,
            inflight: self.inflight.clone(),
        };

        tokio::spawn(async move {
            let result = run_query(source.as_ref(), report, timeout).await;
            if let Ok(data) = &result {
                store.insert_if(report, data.clone(), || !closed.load(Ordering::SeqCst));
            }
            drop(slot);
            let _ = sender.send(result);
        });
    }
}

/// Frees the in-flight slot when the computation ends, including by panic.
struct SlotGuard {
    report: ReportName,
    inflight: InFlightReports,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inflight.release(self.report);
    }
}

async fn run_query(
    source: &dyn ReportSource,
    report: ReportName,
    timeout: Duration,
) -> ComputeResult {
    let started_at = Instant::now();
    let outcome = tokio::time::timeout(timeout, source.run_report(report)).await;
    let elapsed = started_at.elapsed();
    histogram!(METRIC_QUERY_MS, "report" => report.as_str())
        .record(elapsed.as_secs_f64() * 1000.0);

    let result = match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(ReportError::from_repo(report, err)),
        Err(_) => Err(ReportError::Timeout { report }),
    };

    match &result {
        Ok(data) => debug!(
            target = "h1b_insights::cache",
            report = %report,
            rows = data.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "report computed"
        ),
        Err(err) => {
            counter!(METRIC_FAILURE, "report" => report.as_str()).increment(1);
            warn!(
                target = "h1b_insights::cache",
                report = %report,
                error = %err,
                elapsed_ms = elapsed.as_millis() as u64,
                "report computation failed"
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::domain::reports::ReportRow;

    use super::*;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReportSource for CountingSource {
        async fn run_report(&self, report: ReportName) -> Result<ReportData, RepoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut row = ReportRow::new();
            row.insert("report".to_string(), json!(report.as_str()));
            Ok(ReportData::new(vec![row]))
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl ReportSource for PanickingSource {
        async fn run_report(&self, _report: ReportName) -> Result<ReportData, RepoError> {
            panic!("source exploded");
        }
    }

    #[derive(Default)]
    struct GatedSource {
        gate: Notify,
    }

    #[async_trait]
    impl ReportSource for GatedSource {
        async fn run_report(&self, _report: ReportName) -> Result<ReportData, RepoError> {
            self.gate.notified().await;
            Ok(ReportData::new(vec![ReportRow::new()]))
        }
    }

    #[tokio::test]
    async fn computation_finishing_after_shutdown_is_not_stored() {
        let source = Arc::new(GatedSource::default());
        let manager = Arc::new(CacheManager::new(CacheConfig::default(), source.clone()));

        let reader = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.fetch(ReportName::CompanyStats).await }
        });
        while !manager.inflight.is_running(ReportName::CompanyStats) {
            tokio::task::yield_now().await;
        }

        manager.shutdown().await;
        source.gate.notify_one();

        let result = reader.await.expect("reader task");
        assert_eq!(result.expect("computation completes").len(), 1);
        assert!(manager.store.is_empty());
        assert!(manager.inflight.is_empty());
    }

    #[tokio::test]
    async fn refresh_bypasses_fresh_entry() {
        let source = Arc::new(CountingSource::default());
        let manager = CacheManager::new(CacheConfig::default(), source.clone());

        let first = manager.fetch(ReportName::GenderStats).await.expect("fetch");
        let refreshed = manager
            .refresh(ReportName::GenderStats)
            .await
            .expect("refresh");

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!first.same_rows(&refreshed));

        let served = manager.fetch(ReportName::GenderStats).await.expect("fetch");
        assert!(served.same_rows(&refreshed));
    }

    #[tokio::test]
    async fn panicking_computation_releases_its_slot() {
        let manager = CacheManager::new(CacheConfig::default(), Arc::new(PanickingSource));

        let err = manager
            .fetch(ReportName::StateStats)
            .await
            .expect_err("panicking source should fail");
        assert!(matches!(err, ReportError::Aborted { .. }));
        assert!(manager.inflight.is_empty());
        assert!(manager.store.is_empty());
    }

    #[tokio::test]
    async fn status_lists_every_report() {
        let manager = CacheManager::new(
            CacheConfig::default(),
            Arc::new(CountingSource::default()),
        );
        manager
            .fetch(ReportName::IndustryApproval)
            .await
            .expect("fetch");

        let status = manager.status();
        assert_eq!(status.len(), ReportName::ALL.len());

        let approval = status
            .iter()
            .find(|entry| entry.report == ReportName::IndustryApproval)
            .expect("industry approval status");
        assert_eq!(approval.state, EntryState::Cached);
        assert_eq!(approval.rows, Some(1));
        assert_eq!(approval.endpoint, "/h1b/industry-approval");
        assert!(!approval.computing);
        assert_eq!(approval.sample_unit, "applications");

        let missing = status
            .iter()
            .find(|entry| entry.report == ReportName::JobLevelStats)
            .expect("job level status");
        assert_eq!(missing.state, EntryState::Missing);
    }

    #[test]
    fn report_error_exposes_report() {
        let err = ReportError::from_repo(ReportName::H1bTrends, RepoError::Timeout);
        assert_eq!(err, ReportError::Timeout {
            report: ReportName::H1bTrends
        });
        assert_eq!(err.report(), Some(ReportName::H1bTrends));
        assert_eq!(ReportError::ShutDown.report(), None);
    }
}
