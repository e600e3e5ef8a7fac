//! In-memory doubles for exercising the orchestrator without a live engine.

use std::{
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::research_job::{JobStatus, ResearchJob, Verbosity},
    },
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    cancellation::CancellationCoordinator,
    pipeline::{ResearchEngine, ResearchState, StageDefinition},
    progress::{ProgressEvent, ProgressSink},
};

pub async fn memory_db() -> Arc<SurrealDbClient> {
    let namespace = "research_test";
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory(namespace, &database)
        .await
        .expect("Failed to create in-memory SurrealDB");
    db.ensure_initialized()
        .await
        .expect("Failed to build indexes");
    Arc::new(db)
}

/// Scriptable engine: every stage echoes its name unless told to fail, hang
/// or file a cancellation while it runs.
pub struct MockEngine {
    stages: Vec<StageDefinition>,
    subjects: Vec<String>,
    fail_at: Option<String>,
    hang_at: Option<String>,
    cancel_during: Option<String>,
    panic_at: Option<String>,
    stage_delay: Option<Duration>,
    cancellation: OnceLock<Arc<CancellationCoordinator>>,
    calls: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    abort_tokens: Mutex<Vec<CancellationToken>>,
}

impl MockEngine {
    pub fn with_stages(names: &[&str]) -> Self {
        Self {
            stages: names
                .iter()
                .map(|name| StageDefinition::new(*name, format!("Running {name}")))
                .collect(),
            subjects: vec!["ds1".to_string()],
            fail_at: None,
            hang_at: None,
            cancel_during: None,
            panic_at: None,
            stage_delay: None,
            cancellation: OnceLock::new(),
            calls: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            abort_tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn three_stages() -> Self {
        Self::with_stages(&["decompose", "execute", "synthesize"])
    }

    #[must_use]
    pub fn failing_at(mut self, stage: &str) -> Self {
        self.fail_at = Some(stage.to_string());
        self
    }

    #[must_use]
    pub fn hanging_at(mut self, stage: &str) -> Self {
        self.hang_at = Some(stage.to_string());
        self
    }

    #[must_use]
    pub fn cancelling_during(mut self, stage: &str) -> Self {
        self.cancel_during = Some(stage.to_string());
        self
    }

    #[must_use]
    pub fn panicking_at(mut self, stage: &str) -> Self {
        self.panic_at = Some(stage.to_string());
        self
    }

    #[must_use]
    pub fn with_stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_subjects(mut self, subjects: &[&str]) -> Self {
        self.subjects = subjects.iter().map(ToString::to_string).collect();
        self
    }

    pub fn attach_cancellation(&self, coordinator: Arc<CancellationCoordinator>) {
        let _ = self.cancellation.set(coordinator);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn abort_tokens(&self) -> Vec<CancellationToken> {
        self.abort_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResearchEngine for MockEngine {
    async fn subject_exists(&self, subject_ref: &str) -> Result<bool, AppError> {
        Ok(self.subjects.iter().any(|subject| subject == subject_ref))
    }

    fn stages(&self, verbosity: Verbosity) -> Vec<StageDefinition> {
        let mut stages = self.stages.clone();
        if verbosity == Verbosity::Verbose {
            stages.push(StageDefinition::new("verbose_analysis", "Running verbose_analysis"));
        }
        stages
    }

    async fn run_stage(
        &self,
        stage: &StageDefinition,
        job: &ResearchJob,
        state: &ResearchState,
        abort: &CancellationToken,
    ) -> Result<Value, AppError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stage.name.clone());
        self.abort_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(abort.clone());

        if self.cancel_during.as_deref() == Some(stage.name.as_str()) {
            if let Some(coordinator) = self.cancellation.get() {
                coordinator.request_cancel(&job.id).await?;
            }
        }

        if let Some(delay) = self.stage_delay {
            tokio::time::sleep(delay).await;
        }

        if self.hang_at.as_deref() == Some(stage.name.as_str()) {
            abort.cancelled().await;
            return Err(AppError::Engine(format!("stage {} abandoned", stage.name)));
        }

        if self.panic_at.as_deref() == Some(stage.name.as_str()) {
            panic!("stage {} panicked", stage.name);
        }

        if self.fail_at.as_deref() == Some(stage.name.as_str()) {
            return Err(AppError::Engine(format!("stage {} exploded", stage.name)));
        }

        Ok(serde_json::json!({
            "stage": stage.name,
            "seen": state.completed_stages(),
        }))
    }

    async fn release_artifacts(&self, job_id: &str) -> Result<(), AppError> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress_percents(&self, job_id: &str) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Progress(update) if update.job_id == job_id => Some(update.percent),
                _ => None,
            })
            .collect()
    }

    pub fn terminal_statuses(&self) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Terminal { status, .. } => Some(status),
                ProgressEvent::Progress(_) => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
