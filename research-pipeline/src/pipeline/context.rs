use common::{error::AppError, storage::types::research_job::ResearchJob};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Outputs of the stages finished so far, in execution order.
#[derive(Debug, Clone, Default)]
pub struct ResearchState {
    outputs: Vec<(String, Value)>,
}

impl ResearchState {
    pub fn record(&mut self, stage: &str, output: Value) {
        self.outputs.push((stage.to_string(), output));
    }

    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, output)| output)
    }

    pub fn completed_stages(&self) -> Vec<&str> {
        self.outputs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Default result document: every stage output keyed by stage name.
    pub fn to_result(&self) -> Value {
        let outputs: Map<String, Value> = self
            .outputs
            .iter()
            .map(|(name, output)| (name.clone(), output.clone()))
            .collect();

        serde_json::json!({
            "stages_completed": self.completed_stages(),
            "outputs": outputs,
        })
    }
}

pub struct PipelineContext {
    pub job: ResearchJob,
    pub job_id: String,
    pub worker_id: String,
    pub state: ResearchState,
    pub sequence: u64,
    pub deadline: Instant,
    pub abort: CancellationToken,
}

impl PipelineContext {
    pub fn new(job: ResearchJob, worker_id: &str, deadline: Instant) -> Self {
        let job_id = job.id.clone();
        Self {
            job,
            job_id,
            worker_id: worker_id.to_string(),
            state: ResearchState::default(),
            sequence: 0,
            deadline,
            abort: CancellationToken::new(),
        }
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            stages_completed = self.state.len(),
            error = %err,
            "research pipeline aborted"
        );
        err
    }
}
