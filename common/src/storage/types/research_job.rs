use std::{future::Future, time::Duration};

use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

const WRITE_CONFLICT_RETRIES: usize = 8;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Request mode forwarded to the research engine; it decides how many stages run.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Standard,
    Verbose,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Standard => "standard",
            Verbosity::Verbose => "verbose",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Claim,
    Complete,
    Fail,
    Cancel,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Claim => "claim",
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
            JobTransition::Cancel => "cancel",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Running, Completed, Failed, Cancelled],
        events {
            claim {
                transition: { from: Pending, to: Running }
            }
            complete {
                transition: { from: Running, to: Completed }
            }
            fail {
                transition: { from: Running, to: Failed }
            }
            cancel {
                transition: { from: Pending, to: Cancelled }
                transition: { from: Running, to: Cancelled }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn running() -> JobLifecycleMachine<(), Running> {
        pending()
            .claim()
            .expect("claim transition from Pending should exist")
    }
}

fn invalid_transition(status: &JobStatus, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid research job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(status: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (JobStatus::Pending, JobTransition::Claim) => pending()
            .claim()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Complete) => running()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Fail) => running()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Pending, JobTransition::Cancel) => pending()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Running, JobTransition::Cancel) => running()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

/// SurrealDB aborts one of two transactions touching the same record and
/// flags it as retryable.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    err.to_string().contains("can be retried")
}

/// Runs a single-record write, retrying it while it loses write conflicts.
async fn retry_on_conflict<T, F, Fut>(operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, surrealdb::Error>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor(5)
        .max_delay(Duration::from_millis(250))
        .map(jitter)
        .take(WRITE_CONFLICT_RETRIES);

    Ok(RetryIf::spawn(retry_strategy, operation, is_write_conflict).await?)
}

stored_object!(ResearchJob, "research_job", {
    subject_ref: String,
    question: String,
    verbosity: Verbosity,
    status: JobStatus,
    current_stage: Option<String>,
    progress_percent: u32,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    execution_seconds: Option<i64>,
    dispatch_token: Option<String>,
    worker_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value
});

/// Optional filters for [`ResearchJob::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub subject_ref: Option<String>,
    pub status: Option<JobStatus>,
}

impl ResearchJob {
    pub fn new(subject_ref: String, question: String, verbosity: Verbosity) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            subject_ref,
            question,
            verbosity,
            status: JobStatus::Pending,
            current_stage: None,
            progress_percent: 0,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            execution_seconds: None,
            dispatch_token: Some(Uuid::new_v4().to_string()),
            worker_id: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn create_and_add_to_db(
        subject_ref: String,
        question: String,
        verbosity: Verbosity,
        db: &SurrealDbClient,
    ) -> Result<ResearchJob, AppError> {
        let job = Self::new(subject_ref, question, verbosity);
        retry_on_conflict(|| db.store_item(job.clone())).await?;
        Ok(job)
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<ResearchJob, AppError> {
        db.get_item::<ResearchJob>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Research job {id} not found")))
    }

    fn elapsed_seconds(&self, now: chrono::DateTime<chrono::Utc>) -> Option<i64> {
        self.started_at
            .map(|started| now.signed_duration_since(started).num_seconds())
    }

    /// Moves a pending job to running on behalf of `worker_id`.
    ///
    /// Returns `None` when the job is no longer pending, which is how a lost
    /// race or a redelivered dispatch unit shows up.
    pub async fn claim(
        id: &str,
        worker_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<ResearchJob>, AppError> {
        debug_assert!(compute_next_status(&JobStatus::Pending, JobTransition::Claim).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $running,
                started_at = $now,
                worker_id = $worker_id,
                updated_at = $now
            WHERE status = $pending
            RETURN *;
        "#;

        let claimed: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(CLAIM_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", id.to_string()))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("pending", JobStatus::Pending.as_str()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .bind(("worker_id", worker_id.to_string()))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        Ok(claimed)
    }

    pub async fn record_progress(
        &self,
        stage_label: &str,
        percent: u32,
        db: &SurrealDbClient,
    ) -> Result<ResearchJob, AppError> {
        if self.status != JobStatus::Running {
            return Err(AppError::Validation(format!(
                "Progress can only be recorded for running jobs, job {} is {}",
                self.id,
                self.status.as_str()
            )));
        }

        const PROGRESS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET current_stage = $stage,
                progress_percent = $percent,
                updated_at = $now
            WHERE status = $running
              AND worker_id = $worker_id
              AND progress_percent <= $percent
            RETURN *;
        "#;

        let updated: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(PROGRESS_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", self.id.clone()))
                .bind(("stage", stage_label.to_string()))
                .bind(("percent", percent.min(100)))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        updated.ok_or_else(|| {
            AppError::Validation(format!(
                "Progress update rejected for research job {}: claim lost or progress would regress",
                self.id
            ))
        })
    }

    pub async fn mark_completed(
        &self,
        result: serde_json::Value,
        db: &SurrealDbClient,
    ) -> Result<ResearchJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Complete)?;
        debug_assert_eq!(next, JobStatus::Completed);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $completed,
                result = $result,
                progress_percent = 100,
                current_stage = NONE,
                error_message = NONE,
                completed_at = $now,
                execution_seconds = $execution_seconds,
                worker_id = NONE,
                updated_at = $now
            WHERE status = $running AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let updated: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(COMPLETE_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", self.id.clone()))
                .bind(("completed", JobStatus::Completed.as_str()))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("result", result.clone()))
                .bind(("now", SurrealDatetime::from(now)))
                .bind(("execution_seconds", self.elapsed_seconds(now)))
                .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Complete))
    }

    pub async fn mark_failed(
        &self,
        error_message: &str,
        db: &SurrealDbClient,
    ) -> Result<ResearchJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Fail)?;
        debug_assert_eq!(next, JobStatus::Failed);

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $failed,
                error_message = $error_message,
                result = NONE,
                completed_at = $now,
                execution_seconds = $execution_seconds,
                worker_id = NONE,
                updated_at = $now
            WHERE status = $running AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let updated: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(FAIL_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", self.id.clone()))
                .bind(("failed", JobStatus::Failed.as_str()))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("error_message", error_message.to_string()))
                .bind(("now", SurrealDatetime::from(now)))
                .bind(("execution_seconds", self.elapsed_seconds(now)))
                .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Fail))
    }

    /// Cancels a running job owned by the worker recorded on `self`.
    pub async fn mark_cancelled(&self, db: &SurrealDbClient) -> Result<ResearchJob, AppError> {
        let next = compute_next_status(&self.status, JobTransition::Cancel)?;
        debug_assert_eq!(next, JobStatus::Cancelled);

        const CANCEL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $cancelled,
                completed_at = $now,
                execution_seconds = $execution_seconds,
                worker_id = NONE,
                updated_at = $now
            WHERE status = $running AND worker_id = $worker_id
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let updated: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(CANCEL_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", self.id.clone()))
                .bind(("cancelled", JobStatus::Cancelled.as_str()))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("now", SurrealDatetime::from(now)))
                .bind(("execution_seconds", self.elapsed_seconds(now)))
                .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        updated.ok_or_else(|| invalid_transition(&self.status, JobTransition::Cancel))
    }

    /// Cancels a job that no worker has claimed yet. `started_at` stays unset.
    ///
    /// Returns `None` when the job is not pending anymore.
    pub async fn cancel_if_pending(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<ResearchJob>, AppError> {
        debug_assert!(compute_next_status(&JobStatus::Pending, JobTransition::Cancel).is_ok());

        const CANCEL_PENDING_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $cancelled,
                completed_at = $now,
                updated_at = $now
            WHERE status = $pending
            RETURN *;
        "#;

        let cancelled: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(CANCEL_PENDING_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", id.to_string()))
                .bind(("cancelled", JobStatus::Cancelled.as_str()))
                .bind(("pending", JobStatus::Pending.as_str()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        Ok(cancelled)
    }

    /// Fails every job still marked running. Only safe to call before any
    /// worker of the current process has started claiming jobs.
    pub async fn fail_orphaned(
        reason: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<ResearchJob>, AppError> {
        debug_assert!(compute_next_status(&JobStatus::Running, JobTransition::Fail).is_ok());

        const ORPHAN_QUERY: &str = r#"
            UPDATE type::table($table)
            SET status = $failed,
                error_message = $reason,
                result = NONE,
                completed_at = $now,
                execution_seconds = IF started_at != NONE THEN
                    time::unix($now) - time::unix(started_at)
                ELSE
                    NONE
                END,
                worker_id = NONE,
                updated_at = $now
            WHERE status = $running
            RETURN *;
        "#;

        let failed: Vec<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(ORPHAN_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("failed", JobStatus::Failed.as_str()))
                .bind(("running", JobStatus::Running.as_str()))
                .bind(("reason", reason.to_string()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?;
            let rows: Vec<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        Ok(failed)
    }

    pub async fn pending_jobs(db: &SurrealDbClient) -> Result<Vec<ResearchJob>, AppError> {
        let jobs: Vec<ResearchJob> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $pending
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("pending", JobStatus::Pending.as_str()))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    pub async fn list(
        filter: &JobFilter,
        limit: usize,
        offset: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ResearchJob>, AppError> {
        let mut conditions = Vec::new();
        if filter.subject_ref.is_some() {
            conditions.push("subject_ref = $subject_ref");
        }
        if filter.status.is_some() {
            conditions.push("status = $status");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT * FROM type::table($table) {where_clause}
             ORDER BY created_at DESC
             LIMIT $limit START $offset"
        );

        let mut query = db
            .client
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("limit", limit.clamp(1, MAX_LIST_LIMIT)))
            .bind(("offset", offset));
        if let Some(subject_ref) = &filter.subject_ref {
            query = query.bind(("subject_ref", subject_ref.clone()));
        }
        if let Some(status) = filter.status {
            query = query.bind(("status", status.as_str()));
        }

        let jobs: Vec<ResearchJob> = query.await?.take(0)?;
        Ok(jobs)
    }

    /// Case-insensitive substring match over past questions, newest first.
    pub async fn search(
        text: &str,
        subject_ref: Option<&str>,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ResearchJob>, AppError> {
        let subject_clause = if subject_ref.is_some() {
            "AND subject_ref = $subject_ref"
        } else {
            ""
        };

        let sql = format!(
            "SELECT * FROM type::table($table)
             WHERE string::contains(string::lowercase(question), $needle) {subject_clause}
             ORDER BY created_at DESC
             LIMIT $limit"
        );

        let mut query = db
            .client
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("needle", text.to_lowercase()))
            .bind(("limit", limit.clamp(1, MAX_LIST_LIMIT)));
        if let Some(subject_ref) = subject_ref {
            query = query.bind(("subject_ref", subject_ref.to_string()));
        }

        let jobs: Vec<ResearchJob> = query.await?.take(0)?;
        Ok(jobs)
    }

    /// Merges `patch` into the job's metadata in a single statement, so
    /// concurrent patches never drop each other's keys.
    pub async fn update_metadata(
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        db: &SurrealDbClient,
    ) -> Result<ResearchJob, AppError> {
        const METADATA_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            MERGE {
                metadata: $patch,
                updated_at: $now
            }
            RETURN *;
        "#;

        let patch = serde_json::Value::Object(patch);
        let updated: Option<ResearchJob> = retry_on_conflict(|| async {
            let mut response = db
                .client
                .query(METADATA_QUERY)
                .bind(("table", Self::table_name()))
                .bind(("id", id.to_string()))
                .bind(("patch", patch.clone()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?;
            let rows: Option<ResearchJob> = response.take(0)?;
            Ok::<_, surrealdb::Error>(rows)
        })
        .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("Research job {id} not found")))
    }

    pub async fn delete(id: &str, db: &SurrealDbClient) -> Result<Option<ResearchJob>, AppError> {
        let deleted: Option<ResearchJob> = db.delete_item(id).await?;
        Ok(deleted)
    }
}
