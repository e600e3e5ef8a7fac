use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::research_job::ResearchJob},
};
use futures::future::join_all;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    pipeline::ResearchPipeline,
    queue::{DispatchQueue, DispatchReceiver, DispatchUnit},
};

pub const ORPHANED_JOB_MESSAGE: &str = "Research worker restarted before the job finished";
pub const CRASHED_JOB_MESSAGE: &str = "Research worker crashed while running the job";

/// Deliveries a unit gets when its run errors out before the job is claimed.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// A fixed number of workers pulling from the shared dispatch queue. Each
/// worker runs one job at a time.
pub struct WorkerPool {
    db: Arc<SurrealDbClient>,
    pipeline: Arc<ResearchPipeline>,
    queue: DispatchQueue,
    receiver: DispatchReceiver,
    worker_count: usize,
}

pub struct WorkerPoolHandle {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        db: Arc<SurrealDbClient>,
        pipeline: Arc<ResearchPipeline>,
        queue: DispatchQueue,
        receiver: DispatchReceiver,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            pipeline,
            queue,
            receiver,
            worker_count: worker_count.max(1),
        }
    }

    /// Recovers state left by a previous process, then spawns the workers.
    ///
    /// Jobs still marked running have lost their worker and are failed; jobs
    /// still pending are queued again.
    pub async fn start(self, shutdown: CancellationToken) -> Result<WorkerPoolHandle, AppError> {
        let orphaned = ResearchJob::fail_orphaned(ORPHANED_JOB_MESSAGE, &self.db).await?;
        for job in &orphaned {
            warn!(job_id = %job.id, "failed research job orphaned by a previous worker");
        }

        let workers = (0..self.worker_count)
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    self.receiver.clone(),
                    self.queue.clone(),
                    Arc::clone(&self.pipeline),
                    shutdown.clone(),
                ))
            })
            .collect();

        let pending = ResearchJob::pending_jobs(&self.db).await?;
        let redelivered = pending.len();
        for job in &pending {
            self.queue.redeliver(DispatchUnit::for_job(job)).await?;
        }

        info!(
            worker_count = self.worker_count,
            orphaned = orphaned.len(),
            redelivered,
            "research worker pool started"
        );

        Ok(WorkerPoolHandle { workers, shutdown })
    }
}

impl WorkerPoolHandle {
    /// Waits for every worker to stop. Workers only exit once shutdown is
    /// requested or the queue closes.
    pub async fn join(self) {
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                error!(error = %err, "research worker exited abnormally");
            }
        }
    }

    /// Requests shutdown and gives in-flight jobs `grace` to finish. Workers
    /// still busy after that are aborted; their jobs are failed as orphans on
    /// the next start.
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let aborts: Vec<_> = self.workers.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, self.join()).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "research workers still busy after grace period, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

/// Aborts the spawned run when the worker owning it goes away, so an aborted
/// worker never leaves its job running detached.
struct RunGuard(AbortHandle);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_worker(
    index: usize,
    receiver: DispatchReceiver,
    queue: DispatchQueue,
    pipeline: Arc<ResearchPipeline>,
    shutdown: CancellationToken,
) {
    let worker_id = format!("research-worker-{index}-{}", Uuid::new_v4());
    debug!(%worker_id, "research worker started");

    loop {
        let unit = tokio::select! {
            () = shutdown.cancelled() => break,
            unit = receiver.next() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        let job_id = unit.job_id.clone();
        let task_unit = unit.clone();
        let task_pipeline = Arc::clone(&pipeline);
        let task_worker_id = worker_id.clone();
        let run = tokio::spawn(async move {
            task_pipeline.process_unit(&task_unit, &task_worker_id).await
        });
        let _guard = RunGuard(run.abort_handle());

        match run.await {
            Ok(Ok(outcome)) => {
                debug!(%worker_id, %job_id, ?outcome, "research dispatch unit processed");
            }
            Ok(Err(err)) => {
                error!(%worker_id, %job_id, error = %err, "research job failed");
                requeue_unclaimed(&pipeline, &queue, &unit).await;
            }
            Err(join_err) => {
                error!(%worker_id, %job_id, error = %join_err, "research job run panicked");
                if let Err(err) = pipeline
                    .fail_abandoned(&job_id, &worker_id, CRASHED_JOB_MESSAGE)
                    .await
                {
                    error!(%worker_id, %job_id, error = %err, "failed to record crashed research job");
                }
            }
        }
    }

    debug!(%worker_id, "research worker stopped");
}

/// Puts a unit back on the queue after a failed run if its job was never
/// claimed, so a store error before the claim does not strand the job.
async fn requeue_unclaimed(pipeline: &ResearchPipeline, queue: &DispatchQueue, unit: &DispatchUnit) {
    let job_id = unit.job_id.as_str();
    match pipeline.is_unclaimed(job_id).await {
        Ok(false) => return,
        Ok(true) => {}
        Err(err) => {
            warn!(%job_id, error = %err, "could not check research job before requeueing");
        }
    }

    let retry = unit.next_attempt();
    if retry.attempt >= MAX_DELIVERY_ATTEMPTS {
        warn!(%job_id, attempts = retry.attempt, "research job left pending after repeated delivery failures");
        return;
    }

    // Redelivered from a separate task: waiting for queue capacity here would
    // block the worker that drains it.
    let queue = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(REDELIVERY_DELAY).await;
        let job_id = retry.job_id.clone();
        if let Err(err) = queue.redeliver(retry).await {
            warn!(%job_id, error = %err, "could not requeue research job");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancellation::CancellationCoordinator,
        dispatcher::Dispatcher,
        pipeline::{ResearchConfig, ResearchTuning},
        queue::dispatch_queue,
        testing::{memory_db, MockEngine, RecordingSink},
    };
    use common::{
        storage::types::research_job::{JobStatus, Verbosity},
        utils::config::AppConfig,
    };

    struct Setup {
        db: Arc<SurrealDbClient>,
        engine: Arc<MockEngine>,
        pipeline: Arc<ResearchPipeline>,
        queue: DispatchQueue,
        pool: WorkerPool,
        sink: Arc<RecordingSink>,
    }

    async fn setup(engine: MockEngine, worker_count: usize) -> Setup {
        let db = memory_db().await;
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(engine);
        let cancellation = Arc::new(CancellationCoordinator::new(Arc::clone(&db), sink.clone()));
        let pipeline = Arc::new(ResearchPipeline::new(
            Arc::clone(&db),
            ResearchConfig {
                tuning: ResearchTuning {
                    job_timeout: Duration::from_secs(30),
                    ..ResearchTuning::default()
                },
            },
            engine.clone(),
            cancellation,
            sink.clone(),
        ));
        let (queue, receiver) = dispatch_queue(64);
        let pool = WorkerPool::new(
            Arc::clone(&db),
            Arc::clone(&pipeline),
            queue.clone(),
            receiver,
            worker_count,
        );

        Setup {
            db,
            engine,
            pipeline,
            queue,
            pool,
            sink,
        }
    }

    async fn wait_for_terminal(db: &SurrealDbClient, job_id: &str) -> ResearchJob {
        for _ in 0..500 {
            let job = ResearchJob::get(job_id, db).await.expect("job");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    async fn create_job(db: &SurrealDbClient, question: &str) -> ResearchJob {
        ResearchJob::create_and_add_to_db("ds1".into(), question.into(), Verbosity::Standard, db)
            .await
            .expect("create job")
    }

    #[tokio::test]
    async fn pool_runs_every_queued_job_once() {
        let engine = MockEngine::three_stages().with_stage_delay(Duration::from_millis(5));
        let Setup {
            db, queue, pool, ..
        } = setup(engine, 2).await;
        let shutdown = CancellationToken::new();
        let handle = pool.start(shutdown.clone()).await.expect("start");

        let mut ids = Vec::new();
        for n in 0..3 {
            let job = create_job(&db, &format!("question {n}")).await;
            queue.enqueue(DispatchUnit::for_job(&job)).expect("enqueue");
            ids.push(job.id);
        }

        for id in &ids {
            let job = wait_for_terminal(&db, id).await;
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.worker_id.is_none());
        }

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn start_fails_orphans_and_requeues_pending_jobs() {
        let Setup {
            db, pool, sink, ..
        } = setup(MockEngine::three_stages(), 1).await;

        let orphan = create_job(&db, "orphan").await;
        ResearchJob::claim(&orphan.id, "previous-process", &db)
            .await
            .expect("claim")
            .expect("claimed");
        let waiting = create_job(&db, "waiting").await;

        let handle = pool
            .start(CancellationToken::new())
            .await
            .expect("start");

        let orphan = ResearchJob::get(&orphan.id, &db).await.expect("orphan");
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.error_message.as_deref(), Some(ORPHANED_JOB_MESSAGE));

        let waiting = wait_for_terminal(&db, &waiting.id).await;
        assert_eq!(waiting.status, JobStatus::Completed);
        assert_eq!(sink.progress_percents(&waiting.id), vec![33, 66, 100]);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panicking_run_fails_the_job_and_worker_keeps_going() {
        let engine = MockEngine::three_stages().panicking_at("execute");
        let Setup {
            db, queue, pool, ..
        } = setup(engine, 1).await;
        let handle = pool
            .start(CancellationToken::new())
            .await
            .expect("start");

        let first = create_job(&db, "first").await;
        queue.enqueue(DispatchUnit::for_job(&first)).expect("enqueue");
        let first = wait_for_terminal(&db, &first.id).await;
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.error_message.as_deref(), Some(CRASHED_JOB_MESSAGE));
        assert_eq!(first.progress_percent, 33);

        let second = create_job(&db, "second").await;
        queue.enqueue(DispatchUnit::for_job(&second)).expect("enqueue");
        let second = wait_for_terminal(&db, &second.id).await;
        assert_eq!(second.status, JobStatus::Failed);

        handle.shutdown(Duration::from_secs(1)).await;
    }
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatcher_and_pool_complete_every_submitted_job() {
        let Setup {
            db,
            engine,
            queue,
            pool,
            ..
        } = setup(MockEngine::three_stages(), 4).await;
        let handle = pool
            .start(CancellationToken::new())
            .await
            .expect("start");
        let dispatcher = Dispatcher::new(
            Arc::clone(&db),
            engine,
            queue,
            AppConfig::default(),
        );

        let mut ids = Vec::new();
        for n in 0..40 {
            let id = dispatcher
                .submit("ds1", &format!("question {n}"), Verbosity::Standard)
                .await
                .expect("submit");
            ids.push(id);
        }

        for id in &ids {
            let job = wait_for_terminal(&db, id).await;
            assert_eq!(job.status, JobStatus::Completed, "job {id}: {:?}", job.error_message);
            assert_eq!(job.progress_percent, 100);
            assert!(job.dispatch_token.is_some());
        }

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn errored_unit_is_requeued_only_while_unclaimed() {
        let Setup { db, pipeline, .. } = setup(MockEngine::three_stages(), 1).await;
        let (queue, receiver) = dispatch_queue(4);
        let job = create_job(&db, "retry me").await;
        let unit = DispatchUnit::for_job(&job);

        requeue_unclaimed(&pipeline, &queue, &unit).await;
        let redelivered = tokio::time::timeout(Duration::from_secs(2), receiver.next())
            .await
            .expect("redelivered in time")
            .expect("unit");
        assert_eq!(redelivered.job_id, job.id);
        assert_eq!(redelivered.token, unit.token);
        assert_eq!(redelivered.attempt, 1);

        let exhausted = DispatchUnit {
            attempt: MAX_DELIVERY_ATTEMPTS,
            ..unit.clone()
        };
        requeue_unclaimed(&pipeline, &queue, &exhausted).await;

        ResearchJob::claim(&job.id, "other-worker", &db)
            .await
            .expect("claim")
            .expect("claimed");
        requeue_unclaimed(&pipeline, &queue, &unit).await;

        let nothing = tokio::time::timeout(Duration::from_millis(600), receiver.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn shutdown_aborts_runs_still_in_flight() {
        let engine = MockEngine::three_stages().with_stage_delay(Duration::from_millis(300));
        let Setup {
            db, queue, pool, ..
        } = setup(engine, 1).await;
        let handle = pool
            .start(CancellationToken::new())
            .await
            .expect("start");

        let job = create_job(&db, "slow").await;
        queue.enqueue(DispatchUnit::for_job(&job)).expect("enqueue");
        for _ in 0..100 {
            let current = ResearchJob::get(&job.id, &db).await.expect("job");
            if current.status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown(Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let stored = ResearchJob::get(&job.id, &db).await.expect("job");
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.progress_percent, 0);
    }
}
