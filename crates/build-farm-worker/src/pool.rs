//! Worker pool for build execution
//!
//! A fixed number of workers share one FIFO queue. Each worker takes a single
//! job, runs it to completion, then takes the next, so at most `worker_count`
//! builds run at once no matter how deep the queue gets.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use build_farm_core::{BuildDirs, BuildRequest, JobId, JobRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::counter::RunningJobs;
use crate::executor::{collect_artifacts, BuildExecutor, ExecutionContext, ExecutionError};

type JobQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BuildRequest>>>;

/// Error recorded on jobs still queued when the pool shuts down
const SHUTDOWN_ERROR: &str = "node shut down before the build started";

/// Default time a finished job stays queryable
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(3600);

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers, i.e. maximum concurrent builds
    pub worker_count: usize,

    /// Provisioned zstd binary passed to every build
    pub tool_path: PathBuf,

    /// Keep per-job scratch directories after the build
    pub keep_tmp_dir_after_build: bool,

    /// How long completed and failed records are kept before eviction
    pub job_retention: Duration,
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_count: build_farm_core::config::default_worker_count(),
            tool_path: tool_path.into(),
            keep_tmp_dir_after_build: false,
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Keep per-job scratch directories after each build
    pub fn with_keep_tmp_dir(mut self, keep: bool) -> Self {
        self.keep_tmp_dir_after_build = keep;
        self
    }

    /// Set how long finished job records stay queryable
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Accepting and executing jobs
    Running,
    /// Finishing running jobs, not accepting new ones
    Draining,
    /// All workers have exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Submission after `stop_accepting`
    #[error("worker pool is not accepting jobs")]
    NotAccepting,

    /// Running jobs did not finish within the grace period
    #[error("graceful shutdown timed out with {0} job(s) still running")]
    ShutdownTimeout(usize),
}

/// State shared between the pool handle and its workers
struct PoolShared {
    config: WorkerPoolConfig,
    dirs: BuildDirs,
    executor: Arc<dyn BuildExecutor>,
    jobs: DashMap<JobId, JobRecord>,
    running: RunningJobs,
}

/// Bounded pool of build workers
///
/// # Example
///
/// ```ignore
/// let config = WorkerPoolConfig::new(zstd_path).with_worker_count(4);
/// let pool = WorkerPool::start(config, dirs, Arc::new(executor));
///
/// let job_id = pool.submit(request)?;
///
/// // ... later, graceful shutdown
/// pool.shutdown(Duration::from_secs(60)).await?;
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    queue: JobQueue,
    sender: Mutex<Option<mpsc::UnboundedSender<BuildRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    sweeper: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the workers and start consuming the queue
    pub fn start(
        config: WorkerPoolConfig,
        dirs: BuildDirs,
        executor: Arc<dyn BuildExecutor>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(PoolShared {
            config,
            dirs,
            executor,
            jobs: DashMap::new(),
            running: RunningJobs::new(),
        });

        let workers = (0..shared.config.worker_count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&shared),
                    Arc::clone(&queue),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&shared)));

        info!(
            worker_count = shared.config.worker_count,
            tool_path = %shared.config.tool_path.display(),
            job_retention_secs = shared.config.job_retention.as_secs(),
            "Worker pool started"
        );

        Self {
            shared,
            queue,
            sender: Mutex::new(Some(sender)),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Running),
            workers: tokio::sync::Mutex::new(workers),
            sweeper,
        }
    }

    /// Enqueue a build and return immediately
    pub fn submit(&self, request: BuildRequest) -> Result<JobId, WorkerPoolError> {
        let id = request.id;
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(WorkerPoolError::NotAccepting)?;

        self.shared.jobs.insert(id, JobRecord::queued(&request));
        if sender.send(request).is_err() {
            self.shared.jobs.remove(&id);
            return Err(WorkerPoolError::NotAccepting);
        }

        debug!(job_id = %id, "Job queued");
        Ok(id)
    }

    /// Snapshot of a job's record
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.shared.jobs.get(&id).map(|record| record.value().clone())
    }

    /// Drop completed and failed records older than the retention period
    ///
    /// Queued and running jobs are never evicted. Returns the number removed.
    pub fn evict_finished(&self) -> usize {
        self.shared.evict_finished()
    }

    /// Number of job records currently held
    pub fn tracked_jobs(&self) -> usize {
        self.shared.jobs.len()
    }

    /// Handle to the running job counter
    pub fn running_jobs(&self) -> RunningJobs {
        self.shared.running.clone()
    }

    /// Maximum number of concurrent builds
    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_count
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Refuse new submissions and let idle workers exit
    ///
    /// Running builds are not interrupted. Safe to call more than once.
    pub fn stop_accepting(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);
        info!(running = self.shared.running.get(), "Worker pool draining");
    }

    /// Wait until every worker has exited and no job is running
    ///
    /// Implies [`stop_accepting`](Self::stop_accepting). Jobs still queued are
    /// recorded as failed since no worker will pick them up.
    pub async fn wait_until_drained(&self) {
        self.stop_accepting();

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().await);
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }

        let mut abandoned = 0;
        {
            let mut queue = self.queue.lock().await;
            while let Ok(request) = queue.try_recv() {
                self.shared.update(request.id, |record| record.mark_failed(SHUTDOWN_ERROR));
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "Queued jobs dropped at shutdown");
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        debug!(running = self.shared.running.get(), "Worker pool drained");
    }

    /// Stop accepting and drain, giving up after `timeout`
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), WorkerPoolError> {
        match tokio::time::timeout(timeout, self.wait_until_drained()).await {
            Ok(()) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.shared.running.get();
                warn!(remaining, "Shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout(remaining))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl PoolShared {
    fn evict_finished(&self) -> usize {
        let retention =
            chrono::Duration::from_std(self.config.job_retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let before = self.jobs.len();
        self.jobs.retain(|_, record| {
            !record.status.is_terminal() || record.finished_at.map_or(true, |at| at > cutoff)
        });
        before.saturating_sub(self.jobs.len())
    }

    fn update(&self, id: JobId, apply: impl FnOnce(&mut JobRecord)) {
        if let Some(mut record) = self.jobs.get_mut(&id) {
            apply(record.value_mut());
        }
    }

    async fn run(&self, worker: usize, request: BuildRequest) {
        let id = request.id;
        let ctx = ExecutionContext {
            output_dir: self.dirs.job_stage_dir(id),
            tmp_dir: self.dirs.job_tmp_dir(id),
            tool_path: self.config.tool_path.clone(),
        };
        self.update(id, JobRecord::mark_running);
        debug!(worker, job_id = %id, "Job started");

        let result = {
            let _running = self.running.start();
            AssertUnwindSafe(self.execute(&request, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutionError::Io(std::io::Error::other(
                        "build executor panicked",
                    )))
                })
        };

        match result {
            Ok(artifacts) => {
                info!(worker, job_id = %id, artifacts = artifacts.len(), "Job completed");
                self.update(id, |record| record.mark_completed(artifacts));
            }
            Err(e) => {
                warn!(worker, job_id = %id, error = %e, "Job failed");
                self.update(id, |record| record.mark_failed(e.to_string()));
                // Partial output must never be served
                remove_dir(&ctx.output_dir).await;
            }
        }

        if !self.config.keep_tmp_dir_after_build {
            remove_dir(&ctx.tmp_dir).await;
        }
    }

    async fn execute(
        &self,
        request: &BuildRequest,
        ctx: &ExecutionContext,
    ) -> Result<Vec<String>, ExecutionError> {
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        tokio::fs::create_dir_all(&ctx.tmp_dir).await?;
        self.executor.execute(request, ctx).await?;
        Ok(collect_artifacts(&ctx.output_dir).await?)
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<PoolShared>,
    queue: JobQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            request = next_job(&queue) => match request {
                Some(request) => request,
                None => break,
            },
        };
        shared.run(worker, request).await;
    }
    debug!(worker, "Worker exited");
}

/// Periodically evict expired job records until the pool is dropped
async fn sweep_loop(shared: Weak<PoolShared>) {
    let period = match shared.upgrade() {
        Some(shared) => (shared.config.job_retention / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(60)),
        None => return,
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let evicted = shared.evict_finished();
        if evicted > 0 {
            debug!(evicted, remaining = shared.jobs.len(), "Evicted finished jobs");
        }
    }
}

async fn next_job(queue: &JobQueue) -> Option<BuildRequest> {
    queue.lock().await.recv().await
}

async fn remove_dir(dir: &std::path::Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Cannot remove job directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("/cache/zstd")
            .with_worker_count(0)
            .with_keep_tmp_dir(true);

        assert_eq!(config.worker_count, 1);
        assert_eq!(config.tool_path, PathBuf::from("/cache/zstd"));
        assert!(config.keep_tmp_dir_after_build);
        assert_eq!(config.job_retention, DEFAULT_JOB_RETENTION);

        let config = config.with_job_retention(Duration::from_secs(5));
        assert_eq!(config.job_retention, Duration::from_secs(5));
    }

    #[test]
    fn test_default_worker_count_oversubscribes_by_one() {
        let config = WorkerPoolConfig::new("/cache/zstd");
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(config.worker_count, cpus + 1);
    }
}
