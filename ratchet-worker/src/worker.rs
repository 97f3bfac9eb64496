use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use ratchet_core::{Client, LockedJob};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::JobRegistry;

/// Settings for a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// The queue the pool's workers subscribe to. The empty string is the
    /// default queue.
    pub queue: String,
    /// How many workers to run. Each claimed job pins one pooled connection,
    /// so the client's pool must be sized past this with headroom for
    /// producers.
    pub worker_count: usize,
    /// How long an idle worker sleeps before polling its queue again. Also
    /// bounds how long an idle pool takes to observe shutdown.
    pub wake_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            worker_count: 1,
            wake_interval: Duration::from_secs(5),
        }
    }
}

/// A fixed-size pool of workers sharing one [`Client`].
pub struct WorkerPool {
    client: Client,
    registry: Arc<JobRegistry>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(client: Client, registry: JobRegistry, config: WorkerPoolConfig) -> Self {
        Self {
            client,
            registry: Arc::new(registry),
            config,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Launch the pool's workers. Returns immediately; the workers poll and
    /// process on their own tasks until [`shutdown`](WorkerPool::shutdown).
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }

        info!(
            queue = %self.config.queue,
            worker_count = self.config.worker_count,
            "starting worker pool"
        );

        for _ in 0..self.config.worker_count {
            let worker = Worker {
                client: self.client.clone(),
                queue: self.config.queue.clone(),
                wake_interval: self.config.wake_interval,
                registry: self.registry.clone(),
                shutdown: self.shutdown.clone(),
            };

            self.handles.push(tokio::spawn(worker.run()));
        }
    }

    /// Signal every worker and wait for all of them to exit. In-flight
    /// handlers run to completion and settle their claims; idle workers
    /// notice the signal within one wake interval.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();

        for result in join_all(std::mem::take(&mut self.handles)).await {
            if let Err(error) = result {
                error!(%error, "worker task failed during shutdown");
            }
        }

        info!(queue = %self.config.queue, "worker pool drained");
    }
}

/// A single worker: claims jobs from one queue and runs them to a terminal
/// state, one at a time.
struct Worker {
    client: Client,
    queue: String,
    wake_interval: Duration,
    registry: Arc<JobRegistry>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(queue = %self.queue, "worker started");

        while !self.shutdown.is_cancelled() {
            match self.client.lock_job(&self.queue).await {
                Ok(Some(job)) => self.work_one(job).await,
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(error) => {
                    error!(queue = %self.queue, %error, "failed to lock a job");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        debug!(queue = %self.queue, "worker exiting");
    }

    /// Sleep one wake interval. Returns true when shutdown fired first.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.wake_interval) => false,
        }
    }

    async fn work_one(&self, mut job: LockedJob) {
        let labels = [("queue", self.queue.clone())];

        metrics::counter!("ratchet_jobs_dequeued", &labels).increment(1);

        match self.registry.get(&job.job.job_type) {
            Some(work) => {
                let outcome = AssertUnwindSafe(work.handler.run(&mut job))
                    .catch_unwind()
                    .await;

                match outcome {
                    Ok(Ok(())) => {
                        if let Err(error) = job.delete().await {
                            error!(job_id = job.job.id, %error, "failed to delete completed job");
                        } else {
                            metrics::counter!("ratchet_jobs_completed", &labels).increment(1);
                        }
                    }
                    Ok(Err(job_error)) => {
                        let msg = format!("{job_error:#}");
                        if let Err(error) = job.error_with(&msg, &work.retry_policy).await {
                            error!(job_id = job.job.id, %error, "failed to record job error");
                        }

                        metrics::counter!("ratchet_jobs_failed", &labels).increment(1);
                    }
                    Err(panic) => {
                        let msg = format!("job panicked: {}", panic_message(panic));
                        error!(job_id = job.job.id, job_type = %job.job.job_type, "{msg}");
                        if let Err(error) = job.error_with(&msg, &work.retry_policy).await {
                            error!(job_id = job.job.id, %error, "failed to record job panic");
                        }

                        metrics::counter!("ratchet_jobs_failed", &labels).increment(1);
                    }
                }
            }
            None => {
                // An old worker can race a deploy that introduced the type;
                // keep the row visible to operators instead of dropping it.
                let msg = format!("unknown job type: {}", job.job.job_type);
                if let Err(error) = job.error(&msg).await {
                    error!(job_id = job.job.id, %error, "failed to record unknown job type");
                }

                metrics::counter!("ratchet_jobs_unknown_type", &labels).increment(1);
            }
        }

        // The handler may have settled the claim itself; terminal operations
        // on a settled handle are no-ops, so this release is always safe.
        if let Err(error) = job.release().await {
            error!(job_id = job.job.id, %error, "failed to release job");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ratchet_core::{Job, NewJob};
    use sqlx::PgPool;

    use crate::registry::JobHandler;

    struct RecordingHandler {
        runs: AtomicUsize,
        seen_args: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                seen_args: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for RecordingHandler {
        async fn run(&self, job: &mut LockedJob) -> Result<(), anyhow::Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.seen_args.lock().unwrap().push(job.job.args.clone());
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl JobHandler for FailingHandler {
        async fn run(&self, _job: &mut LockedJob) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("the external service is down"))
        }
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl JobHandler for PanickingHandler {
        async fn run(&self, _job: &mut LockedJob) -> Result<(), anyhow::Error> {
            panic!("handler exploded");
        }
    }

    struct SelfDeletingHandler;

    #[async_trait::async_trait]
    impl JobHandler for SelfDeletingHandler {
        async fn run(&self, job: &mut LockedJob) -> Result<(), anyhow::Error> {
            job.delete().await?;
            Ok(())
        }
    }

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            wake_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn count_jobs(db: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT count(*) FROM jobs")
            .fetch_one(db)
            .await
            .expect("failed to count jobs")
    }

    async fn find_one_job(db: &PgPool) -> Option<Job> {
        sqlx::query_as::<_, Job>(
            "SELECT id, queue, priority, run_at, type, args, error_count, last_error FROM jobs LIMIT 1",
        )
        .fetch_optional(db)
        .await
        .expect("failed to query for a job")
    }

    /// Poll `predicate` every 25ms until it holds, for at most 5 seconds.
    async fn wait_until<F, Fut>(predicate: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        panic!("timed out waiting for condition");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pool_processes_an_enqueued_job(db: PgPool) {
        let client = Client::new(db.clone());
        let handler = RecordingHandler::new();

        let mut registry = JobRegistry::new();
        registry.register("SendReport", handler.clone());

        let args = serde_json::json!(["monthly", 42]).to_string().into_bytes();
        client
            .enqueue(NewJob::new("SendReport").args(args.clone()))
            .await
            .expect("failed to enqueue job");

        let mut pool = WorkerPool::new(client, registry, test_config());
        pool.start();

        wait_until(|| async { count_jobs(&db).await == 0 }).await;
        pool.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(handler.seen_args.lock().unwrap()[0], args);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pool_fans_out_across_workers(db: PgPool) {
        let client = Client::new(db.clone());
        let handler = RecordingHandler::new();

        let mut registry = JobRegistry::new();
        registry.register("SendReport", handler.clone());

        for _ in 0..10 {
            client
                .enqueue(NewJob::new("SendReport"))
                .await
                .expect("failed to enqueue job");
        }

        let config = WorkerPoolConfig {
            worker_count: 2,
            ..test_config()
        };
        let mut pool = WorkerPool::new(client, registry, config);
        pool.start();

        wait_until(|| async { count_jobs(&db).await == 0 }).await;
        pool.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 10);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pool_records_handler_failure(db: PgPool) {
        let client = Client::new(db.clone());

        let mut registry = JobRegistry::new();
        registry.register("AlwaysFails", Arc::new(FailingHandler));

        client
            .enqueue(NewJob::new("AlwaysFails"))
            .await
            .expect("failed to enqueue job");

        let mut pool = WorkerPool::new(client, registry, test_config());
        pool.start();

        wait_until(|| async {
            find_one_job(&db)
                .await
                .is_some_and(|job| job.error_count == 1)
        })
        .await;
        pool.shutdown().await;

        let row = find_one_job(&db).await.expect("job should be kept for retry");
        assert_eq!(row.error_count, 1);
        let last_error = row.last_error.expect("job should have an error recorded");
        assert!(last_error.contains("the external service is down"));
        assert!(row.run_at > chrono::Utc::now());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pool_contains_handler_panics(db: PgPool) {
        let client = Client::new(db.clone());

        let mut registry = JobRegistry::new();
        registry.register("Explodes", Arc::new(PanickingHandler));

        client
            .enqueue(NewJob::new("Explodes"))
            .await
            .expect("failed to enqueue job");

        let mut pool = WorkerPool::new(client, registry, test_config());
        pool.start();

        wait_until(|| async {
            find_one_job(&db)
                .await
                .is_some_and(|job| job.error_count == 1)
        })
        .await;
        pool.shutdown().await;

        let row = find_one_job(&db).await.expect("job should be kept for retry");
        let last_error = row.last_error.expect("job should have an error recorded");
        assert_eq!(last_error, "job panicked: handler exploded");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pool_keeps_jobs_of_unknown_type(db: PgPool) {
        let client = Client::new(db.clone());

        client
            .enqueue(NewJob::new("NotRegistered"))
            .await
            .expect("failed to enqueue job");

        let mut pool = WorkerPool::new(client, JobRegistry::new(), test_config());
        pool.start();

        wait_until(|| async {
            find_one_job(&db)
                .await
                .is_some_and(|job| job.error_count == 1)
        })
        .await;
        pool.shutdown().await;

        let row = find_one_job(&db).await.expect("job should be kept");
        assert_eq!(
            row.last_error.as_deref(),
            Some("unknown job type: NotRegistered")
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_handler_may_settle_the_job_itself(db: PgPool) {
        let client = Client::new(db.clone());

        let mut registry = JobRegistry::new();
        registry.register("SettlesItself", Arc::new(SelfDeletingHandler));

        client
            .enqueue(NewJob::new("SettlesItself"))
            .await
            .expect("failed to enqueue job");

        let mut pool = WorkerPool::new(client, registry, test_config());
        pool.start();

        wait_until(|| async { count_jobs(&db).await == 0 }).await;
        pool.shutdown().await;

        // The worker's own delete and defensive release were no-ops.
        assert_eq!(count_jobs(&db).await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_workers_only_claim_their_queue(db: PgPool) {
        let client = Client::new(db.clone());
        let handler = RecordingHandler::new();

        let mut registry = JobRegistry::new();
        registry.register("SendReport", handler.clone());

        client
            .enqueue(NewJob::new("SendReport"))
            .await
            .expect("failed to enqueue job");

        let config = WorkerPoolConfig {
            queue: "reports".to_owned(),
            ..test_config()
        };
        let mut pool = WorkerPool::new(client, registry, config);
        pool.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(count_jobs(&db).await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_shutdown_drains_idle_workers(db: PgPool) {
        let client = Client::new(db);

        let config = WorkerPoolConfig {
            worker_count: 4,
            ..test_config()
        };
        let mut pool = WorkerPool::new(client, JobRegistry::new(), config);
        pool.start();

        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown timed out");
    }
}
