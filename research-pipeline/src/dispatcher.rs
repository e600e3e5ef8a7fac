use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::research_job::{ResearchJob, Verbosity},
    },
    utils::{config::AppConfig, research_limits::validate_research_request},
};
use tracing::{info, warn};

use crate::{
    pipeline::ResearchEngine,
    queue::{DispatchQueue, DispatchUnit},
};

/// Accepts research requests: validates them, writes the pending record and
/// enqueues exactly one dispatch unit.
pub struct Dispatcher {
    db: Arc<SurrealDbClient>,
    engine: Arc<dyn ResearchEngine>,
    queue: DispatchQueue,
    config: AppConfig,
}

impl Dispatcher {
    pub fn new(
        db: Arc<SurrealDbClient>,
        engine: Arc<dyn ResearchEngine>,
        queue: DispatchQueue,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            engine,
            queue,
            config,
        }
    }

    /// Returns the new job id once the job is both stored and queued.
    #[tracing::instrument(skip(self, question), fields(question_len = question.len()))]
    pub async fn submit(
        &self,
        subject_ref: &str,
        question: &str,
        verbosity: Verbosity,
    ) -> Result<String, AppError> {
        validate_research_request(&self.config, subject_ref, question)?;

        if !self.engine.subject_exists(subject_ref).await? {
            return Err(AppError::NotFound(format!(
                "Dataset {subject_ref} not found"
            )));
        }

        let job = ResearchJob::create_and_add_to_db(
            subject_ref.to_string(),
            question.trim().to_string(),
            verbosity,
            &self.db,
        )
        .await?;

        // The token is already on the record, so no write races the worker
        // that picks the unit up.
        if let Err(err) = self.queue.enqueue(DispatchUnit::for_job(&job)) {
            // No worker will ever see this job, so it must not linger as pending.
            if let Err(delete_err) = ResearchJob::delete(&job.id, &self.db).await {
                warn!(job_id = %job.id, error = %delete_err, "failed to remove undispatched research job");
            }
            return Err(err);
        }

        info!(job_id = %job.id, verbosity = verbosity.as_str(), "research job dispatched");
        Ok(job.id)
    }
}
