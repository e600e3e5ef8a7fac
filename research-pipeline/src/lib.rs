#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod cancellation;
pub mod dispatcher;
pub mod pipeline;
pub mod progress;
pub mod queue;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod worker;

use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};

pub use cancellation::CancellationCoordinator;
pub use dispatcher::Dispatcher;
pub use pipeline::{
    HttpResearchEngine, JobOutcome, ResearchConfig, ResearchEngine, ResearchPipeline,
    ResearchTuning, TIMEOUT_MESSAGE,
};
pub use progress::{ProgressEvent, ProgressHub, ProgressSink, ProgressUpdate};
pub use worker::{WorkerPool, WorkerPoolHandle};

/// Handles the HTTP layer needs; the worker pool is returned separately so
/// the caller decides when it starts.
#[derive(Clone)]
pub struct ResearchServices {
    pub dispatcher: Arc<Dispatcher>,
    pub cancellation: Arc<CancellationCoordinator>,
    pub progress: Arc<ProgressHub>,
    pub engine: Arc<dyn ResearchEngine>,
}

pub fn build_research_services(
    db: Arc<SurrealDbClient>,
    config: &AppConfig,
    engine: Arc<dyn ResearchEngine>,
) -> (ResearchServices, WorkerPool) {
    let research_config = ResearchConfig::from_app_config(config);
    let tuning = &research_config.tuning;

    let progress = Arc::new(ProgressHub::new(tuning.subscriber_capacity));
    let sink: Arc<dyn ProgressSink> = progress.clone();
    let cancellation = Arc::new(CancellationCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&sink),
    ));
    let (queue, receiver) = queue::dispatch_queue(tuning.queue_capacity);
    let worker_count = tuning.worker_count;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&engine),
        queue.clone(),
        config.clone(),
    ));
    let pipeline = Arc::new(ResearchPipeline::new(
        Arc::clone(&db),
        research_config,
        Arc::clone(&engine),
        Arc::clone(&cancellation),
        sink,
    ));
    let pool = WorkerPool::new(db, pipeline, queue, receiver, worker_count);

    (
        ResearchServices {
            dispatcher,
            cancellation,
            progress,
            engine,
        },
        pool,
    )
}
