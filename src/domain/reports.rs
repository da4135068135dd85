//! The report catalog and the shape of report results.

use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::DomainError;

/// One report row: column name to scalar (number, string or null).
pub type ReportRow = Map<String, Value>;

/// Every report the dashboard serves.
///
/// Each report is an independent, parameterless aggregation. The catalog is
/// closed: adding a report means adding a variant, an endpoint and a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportName {
    IndustryApproval,
    IndustrySalary,
    NationalityStats,
    CompanyTierStats,
    GenderStats,
    StateStats,
    IndustrySizeStats,
    CompanyStats,
    SalaryDistribution,
    H1bTrends,
    CompanySizeStats,
    RemoteWorkStats,
    JobLevelStats,
}

impl ReportName {
    pub const ALL: [ReportName; 13] = [
        ReportName::IndustryApproval,
        ReportName::IndustrySalary,
        ReportName::NationalityStats,
        ReportName::CompanyTierStats,
        ReportName::GenderStats,
        ReportName::StateStats,
        ReportName::IndustrySizeStats,
        ReportName::CompanyStats,
        ReportName::SalaryDistribution,
        ReportName::H1bTrends,
        ReportName::CompanySizeStats,
        ReportName::RemoteWorkStats,
        ReportName::JobLevelStats,
    ];

    /// Stable cache key, also used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ReportName::IndustryApproval => "industry_approval",
            ReportName::IndustrySalary => "industry_salary",
            ReportName::NationalityStats => "nationality_stats",
            ReportName::CompanyTierStats => "company_tier_stats",
            ReportName::GenderStats => "gender_stats",
            ReportName::StateStats => "state_stats",
            ReportName::IndustrySizeStats => "industry_size_stats",
            ReportName::CompanyStats => "company_stats",
            ReportName::SalaryDistribution => "salary_distribution",
            ReportName::H1bTrends => "h1b_trends",
            ReportName::CompanySizeStats => "company_size_stats",
            ReportName::RemoteWorkStats => "remote_work_stats",
            ReportName::JobLevelStats => "job_level_stats",
        }
    }

    /// HTTP path the report is served on.
    pub fn endpoint(self) -> &'static str {
        match self {
            ReportName::IndustryApproval => "/h1b/industry-approval",
            ReportName::IndustrySalary => "/industry/salary",
            ReportName::NationalityStats => "/h1b/nationality-stats",
            ReportName::CompanyTierStats => "/company/tier-stats",
            ReportName::GenderStats => "/h1b/gender-stats",
            ReportName::StateStats => "/company/state-stats",
            ReportName::IndustrySizeStats => "/industry/size-stats",
            ReportName::CompanyStats => "/companies/detailed-stats",
            ReportName::SalaryDistribution => "/companies/salary-distribution",
            ReportName::H1bTrends => "/companies/h1b-trends",
            ReportName::CompanySizeStats => "/company/size-stats",
            ReportName::RemoteWorkStats => "/jobs/remote-stats",
            ReportName::JobLevelStats => "/jobs/level-stats",
        }
    }

    /// Minimum number of underlying records a group needs before the report
    /// emits it.
    pub fn min_sample(self) -> u32 {
        match self {
            ReportName::IndustrySalary => 10,
            _ => 5,
        }
    }

    /// What the minimum sample counts, for operator-facing output.
    pub fn sample_unit(self) -> &'static str {
        match self {
            ReportName::IndustryApproval
            | ReportName::NationalityStats
            | ReportName::GenderStats
            | ReportName::CompanyStats
            | ReportName::H1bTrends
            | ReportName::CompanySizeStats
            | ReportName::RemoteWorkStats => "applications",
            ReportName::CompanyTierStats
            | ReportName::StateStats
            | ReportName::IndustrySizeStats => "companies",
            ReportName::IndustrySalary
            | ReportName::SalaryDistribution
            | ReportName::JobLevelStats => "postings",
        }
    }
}

impl fmt::Display for ReportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportName {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value.trim();
        ReportName::ALL
            .into_iter()
            .find(|report| report.as_str() == key)
            .ok_or_else(|| DomainError::unknown_report(key))
    }
}

/// Rows of one computed report.
///
/// Cloning shares the underlying rows, so every reader of a cache entry sees
/// the same allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReportData(Arc<Vec<ReportRow>>);

impl ReportData {
    pub fn new(rows: Vec<ReportRow>) -> Self {
        Self(Arc::new(rows))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.0
    }

    /// True when both handles point at the same cached rows.
    pub fn same_rows(&self, other: &ReportData) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ReportData {
    type Target = [ReportRow];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<ReportRow>> for ReportData {
    fn from(rows: Vec<ReportRow>) -> Self {
        Self::new(rows)
    }
}
