//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::reports::{ReportData, ReportName};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database timeout")]
    Timeout,
    #[error("connection pool unavailable: {message}")]
    Unavailable { message: String },
    #[error("unexpected result shape: {message}")]
    Shape { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }
}

/// Source of truth for report rows.
///
/// Implementations run the report's aggregation and return its rows; they
/// never cache.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn run_report(&self, report: ReportName) -> Result<ReportData, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }

    /// Release pooled connections. Must tolerate repeated calls.
    async fn close(&self) {}
}
