use std::sync::Arc;

use common::{error::AppError, storage::types::research_job::ResearchJob};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use uuid::Uuid;

/// One queued execution of a research job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchUnit {
    pub job_id: String,
    pub token: String,
    /// Deliveries that already ended without the job being claimed.
    pub attempt: u32,
}

impl DispatchUnit {
    /// A first delivery for `job`, carrying the token stored on its record.
    pub fn for_job(job: &ResearchJob) -> Self {
        Self {
            job_id: job.id.clone(),
            token: job
                .dispatch_token
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            attempt: 0,
        }
    }

    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// Producer side of the shared FIFO the worker pool pulls from.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::Sender<DispatchUnit>,
}

/// Consumer side, shared by every worker. Each unit goes to exactly one worker.
#[derive(Clone)]
pub struct DispatchReceiver {
    inner: Arc<Mutex<mpsc::Receiver<DispatchUnit>>>,
}

pub fn dispatch_queue(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        DispatchQueue { sender },
        DispatchReceiver {
            inner: Arc::new(Mutex::new(receiver)),
        },
    )
}

impl DispatchQueue {
    /// Enqueues `unit` without waiting.
    pub fn enqueue(&self, unit: DispatchUnit) -> Result<(), AppError> {
        self.sender.try_send(unit).map_err(|err| match err {
            TrySendError::Full(_) => {
                AppError::Dispatch("research queue is at capacity".to_string())
            }
            TrySendError::Closed(_) => {
                AppError::Dispatch("research queue is unavailable".to_string())
            }
        })
    }

    /// Puts an existing unit back on the queue, waiting for capacity.
    pub async fn redeliver(&self, unit: DispatchUnit) -> Result<(), AppError> {
        self.sender
            .send(unit)
            .await
            .map_err(|_| AppError::Dispatch("research queue is unavailable".to_string()))
    }
}

impl DispatchReceiver {
    /// Waits for the next unit. `None` once every producer is gone.
    pub async fn next(&self) -> Option<DispatchUnit> {
        self.inner.lock().await.recv().await
    }
}
