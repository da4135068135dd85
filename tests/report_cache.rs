use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use h1b_insights::application::repos::{RepoError, ReportSource};
use h1b_insights::cache::{CacheConfig, CacheManager, EntryState, ReportError};
use h1b_insights::domain::reports::{ReportData, ReportName, ReportRow};
use serde_json::json;

#[derive(Default)]
struct FakeSource {
    calls: AtomicUsize,
    closes: AtomicUsize,
    delay: Duration,
    failing: Mutex<HashSet<ReportName>>,
}

impl FakeSource {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn fail(&self, report: ReportName) {
        self.failing.lock().expect("failing set").insert(report);
    }

    fn recover(&self, report: ReportName) {
        self.failing.lock().expect("failing set").remove(&report);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportSource for FakeSource {
    async fn run_report(&self, report: ReportName) -> Result<ReportData, RepoError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().expect("failing set").contains(&report) {
            return Err(RepoError::from_persistence("relation \"h1b\" does not exist"));
        }

        let mut row = ReportRow::new();
        row.insert("report".to_string(), json!(report.as_str()));
        row.insert("call".to_string(), json!(call));
        Ok(ReportData::new(vec![row]))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn config_with_ttl(seconds: u64) -> CacheConfig {
    CacheConfig {
        ttl_seconds: seconds,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_reads_within_ttl_share_one_computation() {
    let source = Arc::new(FakeSource::default());
    let manager = CacheManager::new(config_with_ttl(60), source.clone());

    let first = manager.fetch(ReportName::IndustryApproval).await.expect("first read");
    tokio::time::advance(Duration::from_secs(59)).await;
    let second = manager.fetch(ReportName::IndustryApproval).await.expect("second read");

    assert!(first.same_rows(&second));
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_coalesce_into_one_query() {
    let source = Arc::new(FakeSource::with_delay(Duration::from_millis(250)));
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    let results = join_all((0..32).map(|_| manager.fetch(ReportName::StateStats))).await;

    assert_eq!(source.calls(), 1);
    let first = results[0].as_ref().expect("first result");
    for result in &results {
        let data = result.as_ref().expect("every caller succeeds");
        assert!(data.same_rows(first));
    }
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_recomputed_once() {
    let source = Arc::new(FakeSource::default());
    let manager = CacheManager::new(config_with_ttl(60), source.clone());

    let stale = manager.fetch(ReportName::H1bTrends).await.expect("cold read");
    tokio::time::advance(Duration::from_secs(60)).await;

    let fresh = manager.fetch(ReportName::H1bTrends).await.expect("expired read");
    let again = manager.fetch(ReportName::H1bTrends).await.expect("fresh read");

    assert_eq!(source.calls(), 2);
    assert!(!stale.same_rows(&fresh));
    assert!(fresh.same_rows(&again));
}

#[tokio::test]
async fn failure_degrades_to_empty_and_is_not_cached() {
    let source = Arc::new(FakeSource::default());
    source.fail(ReportName::GenderStats);
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    let degraded = manager.get(ReportName::GenderStats).await;
    assert!(degraded.is_empty());

    match manager.fetch(ReportName::GenderStats).await {
        Err(ReportError::Query { report, message }) => {
            assert_eq!(report, ReportName::GenderStats);
            assert!(message.contains("does not exist"));
        }
        other => panic!("expected query failure, got {other:?}"),
    }
    assert_eq!(source.calls(), 2);

    source.recover(ReportName::GenderStats);
    let recovered = manager.fetch(ReportName::GenderStats).await.expect("retry succeeds");
    assert_eq!(recovered.len(), 1);
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_entry() {
    let source = Arc::new(FakeSource::default());
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    let cached = manager.fetch(ReportName::CompanyStats).await.expect("cold read");
    source.fail(ReportName::CompanyStats);

    let refreshed = manager.refresh(ReportName::CompanyStats).await;
    assert!(refreshed.is_err());

    let served = manager.fetch(ReportName::CompanyStats).await.expect("cached read");
    assert!(served.same_rows(&cached));
}

#[tokio::test]
async fn warm_all_isolates_failing_reports() {
    let source = Arc::new(FakeSource::default());
    source.fail(ReportName::IndustrySalary);
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    let summary = manager.warm_all().await;

    assert!(!summary.is_complete());
    assert_eq!(summary.warmed.len(), ReportName::ALL.len() - 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].report, ReportName::IndustrySalary);
    assert!(!summary.warmed.contains(&ReportName::IndustrySalary));

    for status in manager.status() {
        let expected = if status.report == ReportName::IndustrySalary {
            EntryState::Missing
        } else {
            EntryState::Cached
        };
        assert_eq!(status.state, expected, "{}", status.report);
    }

    manager
        .fetch(ReportName::IndustryApproval)
        .await
        .expect("warmed read");
    assert_eq!(source.calls(), ReportName::ALL.len());
}

#[tokio::test]
async fn invalidate_forces_recomputation() {
    let source = Arc::new(FakeSource::default());
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    manager.fetch(ReportName::JobLevelStats).await.expect("cold read");
    assert!(manager.invalidate(ReportName::JobLevelStats));
    assert!(!manager.invalidate(ReportName::JobLevelStats));

    manager.fetch(ReportName::JobLevelStats).await.expect("read after invalidate");
    assert_eq!(source.calls(), 2);

    manager.invalidate_all();
    manager.fetch(ReportName::JobLevelStats).await.expect("read after clear");
    assert_eq!(source.calls(), 3);
}

#[tokio::test]
async fn disabled_cache_reads_through_every_time() {
    let source = Arc::new(FakeSource::default());
    let config = CacheConfig {
        enabled: false,
        ..Default::default()
    };
    let manager = CacheManager::new(config, source.clone());

    manager.fetch(ReportName::RemoteWorkStats).await.expect("first read");
    manager.fetch(ReportName::RemoteWorkStats).await.expect("second read");

    assert_eq!(source.calls(), 2);
    assert!(
        manager
            .status()
            .iter()
            .all(|status| status.state == EntryState::Missing)
    );
}

#[tokio::test(start_paused = true)]
async fn slow_query_times_out() {
    let source = Arc::new(FakeSource::with_delay(Duration::from_secs(120)));
    let config = CacheConfig {
        query_timeout_seconds: 1,
        ..Default::default()
    };
    let manager = CacheManager::new(config, source.clone());

    let err = manager
        .fetch(ReportName::SalaryDistribution)
        .await
        .expect_err("query should time out");
    assert_eq!(err, ReportError::Timeout {
        report: ReportName::SalaryDistribution
    });
    assert!(manager.get(ReportName::SalaryDistribution).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_caller_does_not_cancel_shared_computation() {
    let source = Arc::new(FakeSource::with_delay(Duration::from_secs(10)));
    let manager = CacheManager::new(CacheConfig::default(), source.clone());

    let abandoned =
        tokio::time::timeout(Duration::from_secs(1), manager.fetch(ReportName::CompanySizeStats))
            .await;
    assert!(abandoned.is_err());

    let data = manager
        .fetch(ReportName::CompanySizeStats)
        .await
        .expect("joined computation completes");
    assert_eq!(data.len(), 1);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let source = Arc::new(FakeSource::default());
    let manager = CacheManager::new(CacheConfig::default(), source.clone());
    manager.fetch(ReportName::NationalityStats).await.expect("cold read");

    manager.shutdown().await;
    manager.shutdown().await;

    assert!(manager.is_shut_down());
    assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.fetch(ReportName::NationalityStats).await,
        Err(ReportError::ShutDown)
    );
    assert!(manager.get(ReportName::NationalityStats).await.is_empty());
    assert!(
        manager
            .status()
            .iter()
            .all(|status| status.state == EntryState::Missing)
    );
}
