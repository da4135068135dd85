//! Registry of report computations currently running.
//!
//! The first caller to miss on a report claims its slot and starts the
//! computation; callers arriving while it runs join the same shared future.
//! The slot is released once the result has been stored.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::sync::oneshot;

use crate::domain::reports::{ReportData, ReportName};

use super::manager::ReportError;

pub type ComputeResult = Result<ReportData, ReportError>;

/// Future resolving to the outcome of one in-flight computation.
pub type PendingReport = Shared<BoxFuture<'static, ComputeResult>>;

/// Outcome of [`InFlightReports::claim`].
pub enum Claim {
    /// Another caller is already computing the report.
    Joined(PendingReport),
    /// The caller owns the computation and must resolve it through `sender`.
    Started {
        pending: PendingReport,
        sender: oneshot::Sender<ComputeResult>,
    },
}

#[derive(Default, Clone)]
pub struct InFlightReports {
    pending: Arc<DashMap<ReportName, PendingReport>>,
}

impl InFlightReports {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn claim(&self, report: ReportName) -> Claim {
        match self.pending.entry(report) {
            Entry::Occupied(occupied) => Claim::Joined(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                let pending = async move {
                    receiver.await.unwrap_or_else(|_| {
                        Err(ReportError::Aborted {
                            report,
                            message: "computation dropped before completing".to_string(),
                        })
                    })
                }
                .boxed()
                .shared();
                vacant.insert(pending.clone());
                Claim::Started { pending, sender }
            }
        }
    }

    pub fn release(&self, report: ReportName) {
        self.pending.remove(&report);
    }

    pub fn is_running(&self, report: ReportName) -> bool {
        self.pending.contains_key(&report)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
