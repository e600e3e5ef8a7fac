use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::research_job::{ResearchJob, Verbosity},
};
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::context::ResearchState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    /// Stable identifier, also the key of the stage's output in the result.
    pub name: String,
    /// Human readable label stored as the job's `current_stage`.
    pub label: String,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }
}

/// The analysis backend the stage runner drives. Stages run strictly in the
/// order returned by [`ResearchEngine::stages`].
#[async_trait]
pub trait ResearchEngine: Send + Sync {
    async fn subject_exists(&self, subject_ref: &str) -> Result<bool, AppError>;

    fn stages(&self, verbosity: Verbosity) -> Vec<StageDefinition>;

    /// Runs one stage. Implementations should give up promptly once `abort`
    /// fires; the job has already been failed by then.
    async fn run_stage(
        &self,
        stage: &StageDefinition,
        job: &ResearchJob,
        state: &ResearchState,
        abort: &CancellationToken,
    ) -> Result<Value, AppError>;

    async fn compose_result(
        &self,
        _job: &ResearchJob,
        state: &ResearchState,
    ) -> Result<Value, AppError> {
        Ok(state.to_result())
    }

    /// Drops anything the engine cached for a job that is being deleted.
    async fn release_artifacts(&self, job_id: &str) -> Result<(), AppError>;
}

pub const STAGE_DECOMPOSE: &str = "decompose";
pub const STAGE_CLASSIFY: &str = "classify";
pub const STAGE_EXECUTE: &str = "execute";
pub const STAGE_ENRICH: &str = "enrich";
pub const STAGE_SYNTHESIZE: &str = "synthesize";
pub const STAGE_FOLLOW_UPS: &str = "follow_ups";
pub const STAGE_VERBOSE_ANALYSIS: &str = "verbose_analysis";

pub fn research_stages(verbosity: Verbosity) -> Vec<StageDefinition> {
    let mut stages = vec![
        StageDefinition::new(STAGE_DECOMPOSE, "Decomposing question"),
        StageDefinition::new(STAGE_CLASSIFY, "Classifying queries"),
        StageDefinition::new(STAGE_EXECUTE, "Executing queries"),
        StageDefinition::new(STAGE_ENRICH, "Enriching with follow-ups"),
        StageDefinition::new(STAGE_SYNTHESIZE, "Synthesizing findings"),
        StageDefinition::new(STAGE_FOLLOW_UPS, "Generating follow-ups"),
    ];
    if verbosity == Verbosity::Verbose {
        stages.push(StageDefinition::new(
            STAGE_VERBOSE_ANALYSIS,
            "Generating verbose analysis",
        ));
    }
    stages
}

/// Shapes the final answer document out of the individual stage outputs.
pub fn assemble_research_result(job: &ResearchJob, state: &ResearchState) -> Value {
    let mut result = Map::new();
    result.insert("research_id".into(), Value::String(job.id.clone()));
    result.insert("main_question".into(), Value::String(job.question.clone()));

    if let Some(Value::Object(synthesis)) = state.output(STAGE_SYNTHESIZE) {
        result.extend(synthesis.clone());
    }
    if let Some(details) = state.output(STAGE_ENRICH) {
        result.insert("supporting_details".into(), details.clone());
    }
    if let Some(follow_ups) = state.output(STAGE_FOLLOW_UPS) {
        result.insert("suggested_follow_ups".into(), follow_ups.clone());
    }
    if let Some(Value::Object(verbose)) = state.output(STAGE_VERBOSE_ANALYSIS) {
        result.extend(verbose.clone());
    }
    result.insert(
        "stages_completed".into(),
        serde_json::json!(state.completed_stages()),
    );

    Value::Object(result)
}

/// Talks to the analysis service over HTTP, one request per stage.
pub struct HttpResearchEngine {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpResearchEngine {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|err| AppError::Validation(format!("invalid research engine url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Validation(format!(
                "research engine url {base_url} cannot carry a path"
            )));
        }

        Ok(Self { client, base_url })
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AppError::InternalError("research engine url has no path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_stage(
        &self,
        stage: &StageDefinition,
        job: &ResearchJob,
        state: &ResearchState,
    ) -> anyhow::Result<Value> {
        let body = serde_json::json!({
            "job_id": job.id,
            "subject_ref": job.subject_ref,
            "question": job.question,
            "verbosity": job.verbosity.as_str(),
            "previous": state.to_result()["outputs"],
        });

        let response = self
            .client
            .post(self.endpoint(&["stages", &stage.name])?)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("stage {} request failed", stage.name))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("stage {} returned {status}: {detail}", stage.name);
        }

        response
            .json::<Value>()
            .await
            .with_context(|| format!("stage {} returned an unreadable body", stage.name))
    }
}

#[async_trait]
impl ResearchEngine for HttpResearchEngine {
    async fn subject_exists(&self, subject_ref: &str) -> Result<bool, AppError> {
        let response = self
            .client
            .get(self.endpoint(&["subjects", subject_ref])?)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(AppError::Engine(format!(
                "subject lookup for {subject_ref} returned {status}"
            ))),
        }
    }

    fn stages(&self, verbosity: Verbosity) -> Vec<StageDefinition> {
        research_stages(verbosity)
    }

    async fn run_stage(
        &self,
        stage: &StageDefinition,
        job: &ResearchJob,
        state: &ResearchState,
        abort: &CancellationToken,
    ) -> Result<Value, AppError> {
        tokio::select! {
            () = abort.cancelled() => {
                debug!(job_id = %job.id, stage = %stage.name, "stage request abandoned");
                Err(AppError::Engine(format!("stage {} abandoned", stage.name)))
            }
            output = self.post_stage(stage, job, state) => {
                output.map_err(|err| AppError::Engine(format!("{err:#}")))
            }
        }
    }

    async fn compose_result(
        &self,
        job: &ResearchJob,
        state: &ResearchState,
    ) -> Result<Value, AppError> {
        Ok(assemble_research_result(job, state))
    }

    async fn release_artifacts(&self, job_id: &str) -> Result<(), AppError> {
        let response = self
            .client
            .delete(self.endpoint(&["jobs", job_id, "artifacts"])?)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(AppError::Engine(format!(
                "releasing artifacts for {job_id} returned {status}"
            ))),
        }
    }
}
