//! Aggregation queries behind every report.
//!
//! Each query is rendered once with its group threshold taken from
//! [`ReportName::min_sample`] and wrapped so Postgres emits one JSON object
//! per row.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use sqlx::query_scalar;
use tracing::debug;

use crate::application::repos::{RepoError, ReportSource};
use crate::domain::reports::{ReportData, ReportName, ReportRow};
use crate::domain::states;

use super::{PostgresRepositories, map_sqlx_error};

static REPORT_QUERIES: Lazy<HashMap<ReportName, String>> = Lazy::new(|| {
    ReportName::ALL
        .into_iter()
        .map(|report| (report, wrap_rows(&aggregation_sql(report))))
        .collect()
});

/// SQL text executed for `report`.
pub fn report_query(report: ReportName) -> Result<&'static str, RepoError> {
    REPORT_QUERIES
        .get(&report)
        .map(String::as_str)
        .ok_or_else(|| {
            RepoError::from_persistence(format!("no query registered for report `{report}`"))
        })
}

fn wrap_rows(inner: &str) -> String {
    format!("SELECT row_to_json(report_rows) FROM (\n{inner}\n) AS report_rows")
}

fn aggregation_sql(report: ReportName) -> String {
    let min = report.min_sample();
    match report {
        ReportName::IndustryApproval => format!(
            r#"
    WITH company_apps AS (
        SELECT
            matched_company_id,
            COUNT(*) AS total_apps,
            SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) AS approved_apps
        FROM h1b
        WHERE matched_company_id IS NOT NULL
          AND status IS NOT NULL
        GROUP BY matched_company_id
    )
    SELECT
        ci.industry,
        SUM(a.total_apps) AS total_applications,
        SUM(a.approved_apps) AS approved_applications,
        ROUND(COALESCE(SUM(a.approved_apps) * 100.0 / NULLIF(SUM(a.total_apps), 0), 0), 2) AS approval_rate
    FROM company_apps a
    JOIN companies c ON c.company_id = a.matched_company_id
    JOIN company_industries ci ON ci.company_id = c.company_id
    WHERE ci.industry IS NOT NULL
    GROUP BY ci.industry
    HAVING SUM(a.total_apps) >= {min}
    ORDER BY approval_rate DESC, ci.industry
    LIMIT 10"#
        ),
        ReportName::IndustrySalary => format!(
            r#"
    WITH yearly_salaries AS (
        SELECT s.min_salary, s.max_salary, ci.industry
        FROM salary s
        JOIN postings p ON s.job_id = p.job_id
        JOIN company_industries ci ON p.company_id = ci.company_id
        WHERE s.pay_period = 'YEARLY'
          AND s.min_salary > 0
          AND s.max_salary < 1000000
    )
    SELECT
        industry,
        COUNT(*) AS job_count,
        ROUND(AVG(min_salary)) AS avg_min_salary,
        ROUND(AVG(max_salary)) AS avg_max_salary,
        ROUND((AVG(min_salary) + AVG(max_salary)) / 2) AS avg_mid_salary
    FROM yearly_salaries
    GROUP BY industry
    HAVING COUNT(*) >= {min}
    ORDER BY avg_mid_salary DESC NULLS LAST"#
        ),
        ReportName::NationalityStats => format!(
            r#"
    WITH nationality_apps AS (
        SELECT
            COALESCE(country_of_birth, country_of_nationality) AS country,
            COUNT(*) AS total_applications,
            SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) AS approved_applications
        FROM h1b
        WHERE COALESCE(country_of_birth, country_of_nationality) IS NOT NULL
        GROUP BY COALESCE(country_of_birth, country_of_nationality)
        HAVING COUNT(*) >= {min}
    )
    SELECT
        country,
        total_applications,
        approved_applications,
        ROUND(COALESCE(approved_applications * 100.0 / NULLIF(total_applications, 0), 0), 2) AS approval_rate
    FROM nationality_apps
    ORDER BY total_applications DESC, country"#
        ),
        ReportName::CompanyTierStats => format!(
            r#"
    WITH company_tiers AS (
        SELECT
            c.company_id,
            ci.industry,
            CASE
                WHEN ec.employee_count < 100 THEN 'Startup'
                WHEN ec.employee_count < 1000 THEN 'SMB'
                ELSE 'Enterprise'
            END AS company_size,
            ec.employee_count,
            ec.follower_count
        FROM companies c
        JOIN employee_counts ec ON c.company_id = ec.company_id
        JOIN company_industries ci ON c.company_id = ci.company_id
    )
    SELECT
        ct.industry,
        ct.company_size,
        COUNT(DISTINCT ct.company_id) AS company_count,
        ROUND(AVG(ct.follower_count)) AS avg_followers,
        ROUND(AVG(ct.employee_count)) AS avg_employees,
        COUNT(DISTINCT p.job_id) AS total_jobs,
        ROUND(AVG(s.max_salary)) AS avg_max_salary,
        ROUND(COALESCE(SUM(CASE WHEN h.status = 1 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(h.id), 0), 0), 2) AS h1b_approval_rate
    FROM company_tiers ct
    JOIN postings p ON ct.company_id = p.company_id
    JOIN salary s ON p.job_id = s.job_id
    LEFT JOIN h1b h ON p.company_id = h.matched_company_id
    WHERE s.pay_period = 'YEARLY'
    GROUP BY ct.industry, ct.company_size
    HAVING COUNT(DISTINCT ct.company_id) >= {min}
    ORDER BY company_count DESC, avg_max_salary DESC NULLS LAST"#
        ),
        ReportName::GenderStats => format!(
            r#"
    SELECT
        gender,
        COUNT(*) AS total_applications,
        SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) AS approved_applications,
        ROUND(COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(*), 0), 0), 2) AS approval_rate
    FROM h1b
    WHERE gender IS NOT NULL
    GROUP BY gender
    HAVING COUNT(*) >= {min}
    ORDER BY total_applications DESC, gender"#
        ),
        ReportName::StateStats => format!(
            r#"
    WITH state_mapping (state_name, state_abbr) AS (
        VALUES
        {values}
    ),
    state_metrics AS (
        SELECT
            c.company_id,
            c.state,
            p.job_id,
            (s.min_salary + s.max_salary) / 2 AS avg_salary,
            ci.industry
        FROM companies c
        JOIN postings p ON c.company_id = p.company_id
        JOIN salary s ON p.job_id = s.job_id
        JOIN company_industries ci ON c.company_id = ci.company_id
        WHERE s.pay_period = 'YEARLY'
          AND c.state IS NOT NULL
    )
    SELECT
        COALESCE(sm.state_abbr, m.state) AS state,
        COUNT(DISTINCT m.company_id) AS num_companies,
        COUNT(DISTINCT m.job_id) AS num_jobs,
        ROUND(AVG(m.avg_salary)) AS avg_salary,
        STRING_AGG(DISTINCT m.industry, ', ' ORDER BY m.industry) AS top_industries
    FROM state_metrics m
    LEFT JOIN state_mapping sm ON LOWER(TRIM(m.state)) = LOWER(sm.state_name)
    GROUP BY COALESCE(sm.state_abbr, m.state)
    HAVING COUNT(DISTINCT m.company_id) >= {min}
    ORDER BY num_jobs DESC, state"#,
            values = states::sql_values()
        ),
        ReportName::IndustrySizeStats => format!(
            r#"
    WITH industry_sizes AS (
        SELECT
            ci.industry,
            COUNT(DISTINCT c.company_id) AS company_count,
            AVG(ec.employee_count) AS avg_employees
        FROM company_industries ci
        JOIN companies c ON ci.company_id = c.company_id
        JOIN employee_counts ec ON c.company_id = ec.company_id
        GROUP BY ci.industry
    )
    SELECT
        industry,
        company_count,
        avg_employees,
        CASE
            WHEN avg_employees > 10000 THEN 'Huge'
            WHEN avg_employees > 1000 THEN 'Large'
            WHEN avg_employees > 100 THEN 'Medium'
            ELSE 'Small'
        END AS size_category,
        ROUND(avg_employees) AS rounded_avg_employees
    FROM industry_sizes
    WHERE company_count >= {min}
    ORDER BY avg_employees DESC NULLS LAST"#
        ),
        ReportName::CompanyStats => format!(
            r#"
    WITH company_h1b_metrics AS (
        SELECT
            matched_company_id,
            COUNT(*) AS total_apps,
            SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) AS approved_apps
        FROM h1b
        WHERE matched_company_id IS NOT NULL
          AND status IS NOT NULL
        GROUP BY matched_company_id
    ),
    company_salary_metrics AS (
        SELECT
            p.company_id,
            ROUND(AVG(s.max_salary)) AS avg_max_salary
        FROM postings p
        JOIN salary s ON p.job_id = s.job_id
        WHERE s.pay_period = 'YEARLY'
          AND s.max_salary < 1000000
          AND s.max_salary > 0
        GROUP BY p.company_id
    )
    SELECT
        c.company_id,
        c.name AS company_name,
        ci.industry,
        ec.employee_count,
        CASE
            WHEN ec.employee_count < 100 THEN 'Startup'
            WHEN ec.employee_count < 1000 THEN 'SMB'
            ELSE 'Enterprise'
        END AS tier,
        hm.total_apps AS total_h1b_applications,
        hm.approved_apps AS approved_h1b_applications,
        ROUND(COALESCE(hm.approved_apps * 100.0 / NULLIF(hm.total_apps, 0), 0), 2) AS h1b_approval_rate,
        COALESCE(sm.avg_max_salary, 0) AS avg_max_salary
    FROM companies c
    JOIN company_industries ci ON c.company_id = ci.company_id
    JOIN employee_counts ec ON c.company_id = ec.company_id
    JOIN company_h1b_metrics hm ON c.company_id = hm.matched_company_id
    LEFT JOIN company_salary_metrics sm ON c.company_id = sm.company_id
    WHERE hm.total_apps >= {min}
    ORDER BY hm.total_apps DESC, c.company_id"#
        ),
        ReportName::SalaryDistribution => format!(
            r#"
    WITH salary_bounds AS (
        SELECT
            c.name AS company_name,
            ci.industry,
            s.min_salary,
            s.max_salary,
            ec.employee_count
        FROM companies c
        JOIN company_industries ci ON c.company_id = ci.company_id
        JOIN postings p ON c.company_id = p.company_id
        JOIN salary s ON p.job_id = s.job_id
        JOIN employee_counts ec ON c.company_id = ec.company_id
        WHERE s.pay_period = 'YEARLY'
          AND s.min_salary > 0
          AND s.max_salary < 1000000
    )
    SELECT
        company_name,
        industry,
        ROUND(AVG(min_salary)) AS avg_min_salary,
        ROUND(AVG(max_salary)) AS avg_max_salary,
        COUNT(*) AS job_count,
        MAX(employee_count) AS employee_count
    FROM salary_bounds
    GROUP BY company_name, industry, employee_count
    HAVING COUNT(*) >= {min}
    ORDER BY AVG(max_salary) DESC, company_name"#
        ),
        ReportName::H1bTrends => format!(
            r#"
    WITH yearly_apps AS (
        SELECT
            c.name AS company_name,
            h.lottery_year AS year,
            COUNT(*) AS applications,
            SUM(CASE WHEN h.status = 1 THEN 1 ELSE 0 END) AS approvals
        FROM h1b h
        JOIN companies c ON h.matched_company_id = c.company_id
        WHERE h.lottery_year IS NOT NULL
        GROUP BY c.name, h.lottery_year
        HAVING COUNT(*) >= {min}
    )
    SELECT
        company_name,
        year,
        applications,
        approvals,
        ROUND(COALESCE(approvals * 100.0 / NULLIF(applications, 0), 0), 2) AS approval_rate
    FROM yearly_apps
    ORDER BY company_name, year"#
        ),
        ReportName::CompanySizeStats => format!(
            r#"
    WITH company_size_groups AS (
        SELECT
            c.company_id,
            CASE
                WHEN ec.employee_count < 100 THEN 'Small (<100)'
                WHEN ec.employee_count < 1000 THEN 'Medium (100-999)'
                WHEN ec.employee_count < 10000 THEN 'Large (1000-9999)'
                ELSE 'Huge (10000+)'
            END AS size_category
        FROM companies c
        JOIN employee_counts ec ON c.company_id = ec.company_id
    )
    SELECT
        csg.size_category,
        ci.industry,
        COUNT(DISTINCT h.matched_company_id) AS companies_count,
        COUNT(*) AS total_applications,
        ROUND(COALESCE(SUM(CASE WHEN h.status = 1 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(*), 0), 0), 2) AS approval_rate
    FROM h1b h
    JOIN company_size_groups csg ON h.matched_company_id = csg.company_id
    JOIN company_industries ci ON csg.company_id = ci.company_id
    WHERE h.matched_company_id IS NOT NULL
    GROUP BY csg.size_category, ci.industry
    HAVING COUNT(*) >= {min}
    ORDER BY csg.size_category, approval_rate DESC, ci.industry"#
        ),
        ReportName::RemoteWorkStats => format!(
            r#"
    WITH arrangements AS (
        SELECT
            CASE
                WHEN p.remote_allowed = 1 THEN 'Remote Allowed'
                ELSE 'Not Specified'
            END AS work_arrangement,
            h.status,
            s.min_salary,
            s.max_salary,
            p.company_id
        FROM h1b h
        JOIN postings p ON h.matched_company_id = p.company_id
        JOIN salary s ON p.job_id = s.job_id
        WHERE s.pay_period = 'YEARLY'
    )
    SELECT
        work_arrangement,
        COUNT(*) AS total_applications,
        ROUND(COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END) * 100.0 / NULLIF(COUNT(*), 0), 0), 2) AS approval_rate,
        ROUND(AVG((min_salary + max_salary) / 2)) AS avg_salary,
        COUNT(DISTINCT company_id) AS unique_companies
    FROM arrangements
    GROUP BY work_arrangement
    HAVING COUNT(*) >= {min}
    ORDER BY total_applications DESC, work_arrangement"#
        ),
        ReportName::JobLevelStats => format!(
            r#"
    WITH job_characteristics AS (
        SELECT
            CASE
                WHEN LOWER(p.title) LIKE '%senior%' OR LOWER(p.title) LIKE '%sr%' OR LOWER(p.title) LIKE '%lead%' THEN 'Senior Level'
                WHEN LOWER(p.title) LIKE '%junior%' OR LOWER(p.title) LIKE '%jr%' OR LOWER(p.title) LIKE '%associate%' THEN 'Junior Level'
                ELSE 'Mid Level'
            END AS seniority_level,
            p.work_type,
            s.min_salary,
            s.max_salary,
            ci.industry
        FROM postings p
        JOIN salary s ON p.job_id = s.job_id
        JOIN company_industries ci ON p.company_id = ci.company_id
        WHERE s.pay_period = 'YEARLY'
    )
    SELECT
        seniority_level,
        work_type,
        industry,
        COUNT(*) AS job_count,
        ROUND(AVG(min_salary)) AS avg_min_salary,
        ROUND(AVG(max_salary)) AS avg_max_salary,
        ROUND(AVG(max_salary - min_salary)) AS avg_salary_range
    FROM job_characteristics
    GROUP BY seniority_level, work_type, industry
    HAVING COUNT(*) >= {min}
    ORDER BY seniority_level, job_count DESC, industry"#
        ),
    }
}

fn into_row(report: ReportName, value: Value) -> Result<ReportRow, RepoError> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(RepoError::shape(format!(
            "report `{report}` produced a non-object row: {other}"
        ))),
    }
}

#[async_trait]
impl ReportSource for PostgresRepositories {
    async fn run_report(&self, report: ReportName) -> Result<ReportData, RepoError> {
        let sql = report_query(report)?;
        let values: Vec<Value> = query_scalar(sql)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let rows = values
            .into_iter()
            .map(|value| into_row(report, value))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            target = "h1b_insights::infra::db::reports",
            report = %report,
            rows = rows.len(),
            "report query completed"
        );

        Ok(ReportData::new(rows))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        PostgresRepositories::health_check(self)
            .await
            .map_err(map_sqlx_error)
    }

    async fn close(&self) {
        self.pool().close().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn every_report_has_a_query() {
        for report in ReportName::ALL {
            let sql = report_query(report).expect("query registered");
            assert!(
                sql.starts_with("SELECT row_to_json(report_rows) FROM ("),
                "{report} is not wrapped"
            );
        }
    }

    #[test]
    fn every_query_applies_its_minimum_sample() {
        for report in ReportName::ALL {
            let sql = report_query(report).expect("query registered");
            let threshold = format!(">= {}", report.min_sample());
            assert!(sql.contains(&threshold), "{report} lacks `{threshold}`");
        }
    }

    #[test]
    fn industry_salary_requires_ten_postings() {
        let sql = report_query(ReportName::IndustrySalary).expect("query registered");
        assert!(sql.contains("HAVING COUNT(*) >= 10"));
    }

    #[test]
    fn rate_columns_guard_their_denominator() {
        let rate_reports = [
            ReportName::IndustryApproval,
            ReportName::NationalityStats,
            ReportName::CompanyTierStats,
            ReportName::GenderStats,
            ReportName::CompanyStats,
            ReportName::H1bTrends,
            ReportName::CompanySizeStats,
            ReportName::RemoteWorkStats,
        ];
        for report in rate_reports {
            let sql = report_query(report).expect("query registered");
            assert!(sql.contains("NULLIF("), "{report} divides without NULLIF");
            assert!(sql.contains("COALESCE("), "{report} may emit a null rate");
        }
    }

    #[test]
    fn state_query_embeds_the_mapping_table() {
        let sql = report_query(ReportName::StateStats).expect("query registered");
        assert!(sql.contains("('California', 'CA')"));
        assert!(sql.contains("('District of Columbia', 'DC')"));
    }

    #[test]
    fn non_object_rows_are_rejected() {
        let row = into_row(ReportName::GenderStats, json!({"gender": "F"})).expect("object row");
        assert_eq!(row.get("gender"), Some(&json!("F")));

        let err = into_row(ReportName::GenderStats, json!([1, 2])).expect_err("array row");
        assert!(matches!(err, RepoError::Shape { .. }));
    }
}
