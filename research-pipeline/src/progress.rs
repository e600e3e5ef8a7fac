use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use common::storage::types::research_job::JobStatus;
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// A successful stage, as written to the job record and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub stage: String,
    pub percent: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    Terminal {
        job_id: String,
        status: JobStatus,
        error: Option<String>,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::Progress(update) => &update.job_id,
            ProgressEvent::Terminal { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Terminal { .. })
    }

    /// Event name used on the streaming wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Progress(_) => "progress",
            ProgressEvent::Terminal { status, .. } => status.as_str(),
        }
    }
}

/// Receives progress from the stage runner. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Per-job fan-out of progress events.
///
/// Channels exist only while someone listens: publishing for a job nobody
/// subscribed to drops the event, and a terminal event tears the channel down,
/// which ends every subscriber's stream. Nothing is buffered for late
/// subscribers; they resynchronise from the job record.
pub struct ProgressHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Forgets the job's channel once its last receiver is gone.
    pub fn release(&self, job_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(job_id);
        }
    }

    pub fn tracked_jobs(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ProgressSink for ProgressHub {
    fn publish(&self, event: ProgressEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let job_id = event.job_id().to_string();
        let terminal = event.is_terminal();

        let Some(sender) = channels.get(&job_id) else {
            return;
        };

        // An error only means every receiver is gone.
        let _ = sender.send(event);

        if terminal || sender.receiver_count() == 0 {
            channels.remove(&job_id);
        }
    }
}
