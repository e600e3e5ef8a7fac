mod config;
mod context;
mod services;

pub use config::{ResearchConfig, ResearchTuning};
pub use context::{PipelineContext, ResearchState};
#[allow(clippy::module_name_repetitions)]
pub use services::{
    assemble_research_result, research_stages, HttpResearchEngine, ResearchEngine,
    StageDefinition, STAGE_VERBOSE_ANALYSIS,
};

use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::research_job::{JobStatus, ResearchJob},
    },
};
use serde_json::Value;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::{
    cancellation::CancellationCoordinator,
    progress::{ProgressEvent, ProgressSink, ProgressUpdate},
    queue::DispatchUnit,
};

pub const TIMEOUT_MESSAGE: &str = "Research job timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// The unit was stale: job deleted, already claimed or already finished.
    Skipped,
}

/// How a run ended before anything was written back.
enum RunEnd {
    Finished(Value),
    Cancelled,
    TimedOut,
    Failed(String),
}

/// `floor(100 * done / total)`, so three stages report 33, 66 and then 100 on completion.
pub fn progress_percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    let percent = done.min(total).saturating_mul(100) / total;
    u32::try_from(percent).unwrap_or(100)
}

fn failure_message(err: AppError) -> String {
    match err {
        AppError::Engine(message) => message,
        other => other.to_string(),
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct ResearchPipeline {
    db: Arc<SurrealDbClient>,
    config: ResearchConfig,
    engine: Arc<dyn ResearchEngine>,
    cancellation: Arc<CancellationCoordinator>,
    sink: Arc<dyn ProgressSink>,
}

impl ResearchPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: ResearchConfig,
        engine: Arc<dyn ResearchEngine>,
        cancellation: Arc<CancellationCoordinator>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            db,
            config,
            engine,
            cancellation,
            sink,
        }
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Executes one dispatch unit. Redelivered or stale units are recognised
    /// and skipped, so a job never runs twice.
    #[tracing::instrument(skip_all, fields(job_id = %unit.job_id, worker_id = %worker_id))]
    pub async fn process_unit(
        &self,
        unit: &DispatchUnit,
        worker_id: &str,
    ) -> Result<JobOutcome, AppError> {
        let job = match ResearchJob::get(&unit.job_id, &self.db).await {
            Ok(job) => job,
            Err(AppError::NotFound(_)) => {
                debug!("dispatch unit refers to a deleted job");
                return Ok(JobOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };

        if job.status != JobStatus::Pending {
            debug!(status = job.status.as_str(), "ignoring redelivered dispatch unit");
            return Ok(JobOutcome::Skipped);
        }

        if job
            .dispatch_token
            .as_deref()
            .is_some_and(|token| token != unit.token)
        {
            debug!("dispatch token differs from the job record");
        }

        if self.cancellation.is_cancel_requested(&job.id) {
            return self.cancel_before_start(&job.id).await;
        }

        let Some(running) = ResearchJob::claim(&job.id, worker_id, &self.db).await? else {
            debug!("research job claimed elsewhere or cancelled before start");
            return Ok(JobOutcome::Skipped);
        };

        info!(
            verbosity = running.verbosity.as_str(),
            subject_ref = %running.subject_ref,
            "claimed research job"
        );

        let deadline = Instant::now() + self.config.tuning.job_timeout;
        let mut ctx = PipelineContext::new(running, worker_id, deadline);
        let outcome = self.drive(&mut ctx).await;
        self.cancellation.clear(&ctx.job_id);
        outcome
    }

    /// Applies a cancel intent that arrived while the job was still queued.
    async fn cancel_before_start(&self, job_id: &str) -> Result<JobOutcome, AppError> {
        match ResearchJob::cancel_if_pending(job_id, &self.db).await? {
            Some(cancelled) => {
                self.cancellation.clear(&cancelled.id);
                self.publish_terminal(&cancelled.id, JobStatus::Cancelled, None);
                Ok(JobOutcome::Cancelled)
            }
            None => {
                // Another delivery claimed it first; that run still needs the intent.
                debug!("research job left pending before the cancel landed");
                Ok(JobOutcome::Skipped)
            }
        }
    }

    /// True while no worker has claimed the job, so a lost unit may be queued again.
    pub async fn is_unclaimed(&self, job_id: &str) -> Result<bool, AppError> {
        match ResearchJob::get(job_id, &self.db).await {
            Ok(job) => Ok(job.status == JobStatus::Pending),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn drive(&self, ctx: &mut PipelineContext) -> Result<JobOutcome, AppError> {
        let pipeline_started = Instant::now();

        let end = match self.run_stages(ctx).await {
            Ok(end) => end,
            Err(err) => {
                let err = ctx.abort(err);
                match ctx.job.mark_failed(&err.to_string(), &self.db).await {
                    Ok(failed) => {
                        self.publish_terminal(&failed.id, JobStatus::Failed, failed.error_message);
                    }
                    Err(mark_err) => {
                        warn!(job_id = %ctx.job_id, error = %mark_err, "could not record research job failure");
                    }
                }
                return Err(err);
            }
        };

        let total_ms = u64::try_from(pipeline_started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match end {
            RunEnd::Finished(mut result) => {
                if let Value::Object(fields) = &mut result {
                    fields
                        .entry("execution_time")
                        .or_insert_with(|| Value::from(pipeline_started.elapsed().as_secs_f64()));
                }
                let completed = ctx.job.mark_completed(result, &self.db).await?;
                self.publish_terminal(&completed.id, JobStatus::Completed, None);
                info!(
                    job_id = %completed.id,
                    total_ms,
                    stages = ctx.state.len(),
                    "research job completed"
                );
                Ok(JobOutcome::Completed)
            }
            RunEnd::Cancelled => {
                let cancelled = ctx.job.mark_cancelled(&self.db).await?;
                self.publish_terminal(&cancelled.id, JobStatus::Cancelled, None);
                info!(
                    job_id = %cancelled.id,
                    total_ms,
                    stages = ctx.state.len(),
                    "research job cancelled"
                );
                Ok(JobOutcome::Cancelled)
            }
            RunEnd::TimedOut => {
                ctx.abort.cancel();
                let failed = ctx.job.mark_failed(TIMEOUT_MESSAGE, &self.db).await?;
                self.publish_terminal(
                    &failed.id,
                    JobStatus::Failed,
                    Some(TIMEOUT_MESSAGE.to_string()),
                );
                warn!(
                    job_id = %failed.id,
                    total_ms,
                    stages = ctx.state.len(),
                    "research job timed out"
                );
                Ok(JobOutcome::TimedOut)
            }
            RunEnd::Failed(message) => {
                let failed = ctx.job.mark_failed(&message, &self.db).await?;
                self.publish_terminal(&failed.id, JobStatus::Failed, Some(message));
                warn!(
                    job_id = %failed.id,
                    total_ms,
                    stages = ctx.state.len(),
                    "research job failed"
                );
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn run_stages(&self, ctx: &mut PipelineContext) -> Result<RunEnd, AppError> {
        let stages = self.engine.stages(ctx.job.verbosity);
        let total = stages.len();

        for (index, stage) in stages.iter().enumerate() {
            // Timeout is checked first: it wins over a pending cancellation.
            if ctx.deadline_passed() {
                return Ok(RunEnd::TimedOut);
            }
            if self.cancellation.is_cancel_requested(&ctx.job_id) {
                return Ok(RunEnd::Cancelled);
            }

            let stage_start = Instant::now();
            let output = tokio::select! {
                biased;
                () = sleep_until(ctx.deadline) => return Ok(RunEnd::TimedOut),
                output = self.engine.run_stage(stage, &ctx.job, &ctx.state, &ctx.abort) => output,
            };

            let output = match output {
                Ok(output) => output,
                Err(err) => return Ok(RunEnd::Failed(failure_message(err))),
            };

            ctx.state.record(&stage.name, output);
            let percent = progress_percent(index + 1, total);
            ctx.job = ctx.job.record_progress(&stage.label, percent, &self.db).await?;
            let sequence = ctx.next_sequence();

            self.sink.publish(ProgressEvent::Progress(ProgressUpdate {
                job_id: ctx.job_id.clone(),
                stage: stage.label.clone(),
                percent,
                sequence,
            }));

            debug!(
                job_id = %ctx.job_id,
                stage = %stage.name,
                percent,
                stage_ms = Self::duration_millis(stage_start.elapsed()),
                "research stage finished"
            );
        }

        if ctx.deadline_passed() {
            return Ok(RunEnd::TimedOut);
        }

        let composed = tokio::select! {
            biased;
            () = sleep_until(ctx.deadline) => return Ok(RunEnd::TimedOut),
            composed = self.engine.compose_result(&ctx.job, &ctx.state) => composed,
        };

        Ok(match composed {
            Ok(result) => RunEnd::Finished(result),
            Err(err) => RunEnd::Failed(failure_message(err)),
        })
    }

    /// Fails a job whose run died without reaching a terminal state, as long as
    /// `worker_id` still holds the claim.
    pub async fn fail_abandoned(
        &self,
        job_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<Option<ResearchJob>, AppError> {
        self.cancellation.clear(job_id);

        let job = match ResearchJob::get(job_id, &self.db).await {
            Ok(job) => job,
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(None);
        }

        let failed = job.mark_failed(reason, &self.db).await?;
        self.publish_terminal(&failed.id, JobStatus::Failed, Some(reason.to_string()));
        Ok(Some(failed))
    }

    fn publish_terminal(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        self.sink.publish(ProgressEvent::Terminal {
            job_id: job_id.to_string(),
            status,
            error,
        });
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}
