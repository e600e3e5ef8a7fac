use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::research_job::{JobStatus, ResearchJob},
    },
};
use tracing::{debug, info};

use crate::progress::{ProgressEvent, ProgressSink};

/// Records cancellation requests and answers the stage runner's boundary checks.
///
/// Cancellation is advisory: a running job only notices it between stages, so
/// it may finish the stage that was in flight when the request came in.
pub struct CancellationCoordinator {
    db: Arc<SurrealDbClient>,
    sink: Arc<dyn ProgressSink>,
    requested: Mutex<HashSet<String>>,
}

impl CancellationCoordinator {
    pub fn new(db: Arc<SurrealDbClient>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            db,
            sink,
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// Idempotent and always accepted. Unknown and terminal jobs are left
    /// untouched; pending jobs are cancelled on the spot; running jobs stop at
    /// their next stage boundary.
    #[tracing::instrument(skip(self))]
    pub async fn request_cancel(&self, job_id: &str) -> Result<(), AppError> {
        let job = match ResearchJob::get(job_id, &self.db).await {
            Ok(job) => job,
            Err(AppError::NotFound(_)) => {
                debug!("cancel ignored for unknown research job");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if job.status.is_terminal() {
            debug!(status = job.status.as_str(), "cancel ignored for finished job");
            return Ok(());
        }

        // Recorded before touching the store so a concurrent claim still sees it.
        self.mark_requested(job_id);

        if job.status == JobStatus::Pending {
            if let Some(cancelled) = ResearchJob::cancel_if_pending(job_id, &self.db).await? {
                self.clear(job_id);
                self.sink.publish(ProgressEvent::Terminal {
                    job_id: cancelled.id,
                    status: JobStatus::Cancelled,
                    error: None,
                });
                info!("pending research job cancelled");
                return Ok(());
            }
        }

        // The runner clears its own entry; this catches a job that reached a
        // terminal state, or was deleted, between our read and the insert above.
        match ResearchJob::get(job_id, &self.db).await {
            Ok(current) if !current.status.is_terminal() => {
                info!("cancellation requested for running research job");
            }
            Ok(_) | Err(AppError::NotFound(_)) => self.clear(job_id),
            Err(err) => return Err(err),
        }

        Ok(())
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> bool {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(job_id)
    }

    pub fn clear(&self, job_id: &str) {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }

    pub fn pending_requests(&self) -> usize {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn mark_requested(&self, job_id: &str) {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.to_string());
    }
}
