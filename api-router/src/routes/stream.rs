use std::{pin::Pin, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use common::{error::AppError, storage::types::research_job::ResearchJob};
use futures::{stream, Stream, StreamExt};
use research_pipeline::{ProgressEvent, ProgressUpdate};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::api_state::ApiState;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub subject_ref: Option<String>,
}

fn create_error_stream(message: impl Into<String>) -> EventStream {
    let message = message.into();
    stream::once(async move { Ok(Event::default().event("error").data(message)) }).boxed()
}

fn progress_event(update: &ProgressUpdate) -> Result<Event, axum::Error> {
    Event::default()
        .event("progress")
        .id(update.sequence.to_string())
        .json_data(update)
}

fn sse_event(event: &ProgressEvent) -> Result<Event, axum::Error> {
    match event {
        ProgressEvent::Progress(update) => progress_event(update),
        ProgressEvent::Terminal {
            job_id,
            status,
            error,
        } => Event::default().event(event.event_name()).json_data(serde_json::json!({
            "job_id": job_id,
            "status": status,
            "error": error,
        })),
    }
}

fn terminal_event_from_record(job: &ResearchJob) -> Result<Event, axum::Error> {
    sse_event(&ProgressEvent::Terminal {
        job_id: job.id.clone(),
        status: job.status,
        error: job.error_message.clone(),
    })
}

/// Live progress for one job: `progress` events followed by exactly one
/// terminal event, after which the stream ends.
pub async fn stream_research_progress(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Sse<EventStream> {
    let job = match ResearchJob::get(&job_id, &state.db).await {
        Ok(job) => job,
        Err(AppError::NotFound(_)) => {
            return Sse::new(create_error_stream(format!(
                "Research job '{job_id}' not found."
            )));
        }
        Err(err) => {
            error!("Failed to fetch research job '{job_id}' for streaming: {err:?}");
            return Sse::new(create_error_stream(
                "An error occurred while retrieving the research job.",
            ));
        }
    };

    if let Some(subject_ref) = params.subject_ref.as_deref() {
        if subject_ref != job.subject_ref {
            return Sse::new(create_error_stream(format!(
                "Research job '{job_id}' does not belong to dataset '{subject_ref}'."
            )));
        }
    }

    let hub = Arc::clone(&state.research.progress);
    let mut receiver = hub.subscribe(&job_id);

    // The job may have finished between the first read and the subscription.
    let current = match ResearchJob::get(&job_id, &state.db).await {
        Ok(current) => current,
        Err(err) => {
            drop(receiver);
            hub.release(&job_id);
            error!("Failed to re-read research job '{job_id}': {err:?}");
            return Sse::new(create_error_stream(
                "An error occurred while retrieving the research job.",
            ));
        }
    };
    if current.status.is_terminal() {
        drop(receiver);
        hub.release(&job_id);
        return Sse::new(stream::once(async move { terminal_event_from_record(&current) }).boxed());
    }

    let db = Arc::clone(&state.db);
    let sse_stream = async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    yield sse_event(&event);
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%job_id, skipped, "progress subscriber lagged behind");
                }
                Err(RecvError::Closed) => {
                    // Channel torn down without a terminal event reaching us.
                    debug!(%job_id, "progress channel closed");
                    if let Ok(job) = ResearchJob::get(&job_id, &db).await {
                        if job.status.is_terminal() {
                            yield terminal_event_from_record(&job);
                        }
                    }
                    break;
                }
            }
        }
    };

    Sse::new(sse_stream.boxed()).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive-ping"),
    )
}
