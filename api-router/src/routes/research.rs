use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::types::research_job::{
        JobFilter, JobStatus, ResearchJob, Verbosity, DEFAULT_LIST_LIMIT,
    },
    utils::research_limits::validate_search_query,
};
use serde::{Deserialize, Serialize};
use research_pipeline::pipeline::STAGE_VERBOSE_ANALYSIS;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::{api_state::ApiState, error::ApiError};

const DEFAULT_SEARCH_LIMIT: usize = 20;
const ANSWER_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct SubmitResearchRequest {
    pub subject_ref: String,
    pub question: String,
    #[serde(default)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub subject_ref: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub subject_ref: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub subject_ref: String,
    pub question: String,
    pub verbosity: Verbosity,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub progress_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<ResultPreview>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_seconds: Option<i64>,
    pub metadata: Value,
}

impl JobView {
    pub fn full(job: ResearchJob) -> Self {
        Self {
            job_id: job.id,
            subject_ref: job.subject_ref,
            question: job.question,
            verbosity: job.verbosity,
            status: job.status,
            current_stage: job.current_stage,
            progress_percent: job.progress_percent,
            result: job.result,
            error_message: job.error_message,
            preview: None,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            execution_seconds: job.execution_seconds,
            metadata: job.metadata,
        }
    }

    /// History rows leave out the potentially large result and the error text,
    /// carrying a small preview derived from the result instead.
    pub fn summary(job: ResearchJob) -> Self {
        let preview = job.result.as_ref().map(ResultPreview::from_result);
        Self {
            result: None,
            error_message: None,
            preview,
            ..Self::full(job)
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ResultPreview {
    pub direct_answer: Option<String>,
    pub key_findings_count: usize,
    pub has_verbose_analysis: bool,
    pub stages_completed: usize,
}

impl ResultPreview {
    pub fn from_result(result: &Value) -> Self {
        let stages = result["stages_completed"].as_array();
        Self {
            direct_answer: result["direct_answer"]
                .as_str()
                .map(|answer| answer.chars().take(ANSWER_PREVIEW_CHARS).collect()),
            key_findings_count: result["key_findings"].as_array().map_or(0, Vec::len),
            has_verbose_analysis: stages.is_some_and(|stages| {
                stages
                    .iter()
                    .any(|stage| stage.as_str() == Some(STAGE_VERBOSE_ANALYSIS))
            }),
            stages_completed: stages.map_or(0, Vec::len),
        }
    }
}

pub async fn submit_research(
    State(state): State<ApiState>,
    Json(request): Json<SubmitResearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .research
        .dispatcher
        .submit(&request.subject_ref, &request.question, request.verbosity)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

pub async fn get_research_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = ResearchJob::get(&job_id, &state.db).await?;
    Ok(Json(JobView::full(job)))
}

pub async fn list_research_jobs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = JobFilter {
        subject_ref: params.subject_ref,
        status: params.status,
    };
    let jobs = ResearchJob::list(
        &filter,
        params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        params.offset.unwrap_or(0),
        &state.db,
    )
    .await?;

    Ok(Json(jobs.into_iter().map(JobView::summary).collect::<Vec<_>>()))
}

pub async fn search_research_jobs(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    validate_search_query(&state.config, &params.query)?;

    let jobs = ResearchJob::search(
        params.query.trim(),
        params.subject_ref.as_deref(),
        params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
        &state.db,
    )
    .await?;

    Ok(Json(jobs.into_iter().map(JobView::summary).collect::<Vec<_>>()))
}

pub async fn cancel_research_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.research.cancellation.request_cancel(&job_id).await?;
    Ok(Json(json!({ "accepted": true })))
}

pub async fn delete_research_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = ResearchJob::get(&job_id, &state.db).await?;
    if !job.status.is_terminal() {
        return Err(AppError::Validation(format!(
            "Research job {job_id} is still {}; cancel it before deleting",
            job.status.as_str()
        ))
        .into());
    }

    if ResearchJob::delete(&job_id, &state.db).await?.is_none() {
        return Err(ApiError::NotFound(format!("Research job {job_id} not found")));
    }

    if let Err(err) = state.research.engine.release_artifacts(&job_id).await {
        warn!(%job_id, error = %err, "failed to release research artifacts");
    }

    info!(%job_id, "research job deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_research_metadata(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let job = ResearchJob::update_metadata(&job_id, patch, &state.db).await?;
    Ok(Json(JobView::full(job)))
}
