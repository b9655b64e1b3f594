//! Dispatch jobs received from producers over Postgres `NOTIFY`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statuscast_core::error::StoreError;
use statuscast_db::{queries, PgStore};
use tracing::{error, info, warn};

use crate::dispatcher::{DispatchSummary, Dispatcher, SkipReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchJob {
    StatusReportUpdate { id: i64 },
    Maintenance { id: i64 },
}

impl DispatchJob {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DispatchJob::StatusReportUpdate { .. } => "status_report_update",
            DispatchJob::Maintenance { .. } => "maintenance",
        }
    }

    pub fn source_id(&self) -> i64 {
        match self {
            DispatchJob::StatusReportUpdate { id } | DispatchJob::Maintenance { id } => *id,
        }
    }
}

/// At-most-once bookkeeping per `(kind, source_id)`.
#[async_trait]
pub trait DispatchClaims: Send + Sync {
    /// `false` when the job was already claimed.
    async fn claim(&self, job: &DispatchJob) -> Result<bool, StoreError>;

    async fn release(&self, job: &DispatchJob) -> Result<(), StoreError>;
}

#[async_trait]
impl DispatchClaims for PgStore {
    async fn claim(&self, job: &DispatchJob) -> Result<bool, StoreError> {
        queries::dispatches::claim(self.pool(), job.kind(), job.source_id())
            .await
            .map_err(StoreError::backend)
    }

    async fn release(&self, job: &DispatchJob) -> Result<(), StoreError> {
        queries::dispatches::release(self.pool(), job.kind(), job.source_id())
            .await
            .map(|_| ())
            .map_err(StoreError::backend)
    }
}

/// Claims the job, then dispatches it. Returns `None` when the job was
/// skipped because it could not be claimed.
pub async fn handle_job(
    dispatcher: &Dispatcher,
    claims: &dyn DispatchClaims,
    job: DispatchJob,
) -> Option<DispatchSummary> {
    match claims.claim(&job).await {
        Ok(true) => {}
        Ok(false) => {
            info!(kind = job.kind(), id = job.source_id(), "already dispatched, skipping");
            return None;
        }
        Err(err) => {
            error!(
                kind = job.kind(),
                id = job.source_id(),
                error = %err,
                "failed to claim dispatch job"
            );
            return None;
        }
    }

    let summary = match job {
        DispatchJob::StatusReportUpdate { id } => {
            dispatcher.dispatch_status_report_update(id).await
        }
        DispatchJob::Maintenance { id } => dispatcher.dispatch_maintenance_update(id).await,
    };

    // nothing was sent, so a later notify for the same source may retry
    if matches!(
        summary.skipped,
        Some(SkipReason::UpdateNotFound | SkipReason::StoreUnavailable)
    ) {
        if let Err(err) = claims.release(&job).await {
            warn!(
                kind = job.kind(),
                id = job.source_id(),
                error = %err,
                "failed to release dispatch claim"
            );
        }
    }

    Some(summary)
}
