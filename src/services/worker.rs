//! Background worker: polls the job queue and runs handlers in a bounded pool.
//!
//! Shutdown waits for in-flight jobs. A job whose name this build does not
//! know is released back to the queue and stops the worker with an error; it
//! means the enqueuer runs a newer version than the worker.

use crate::{
    jobs::JobContext,
    models::job::Job,
    services::job_queue::{FailOutcome, JobQueue, JobRecord},
};
use anyhow::{Result, anyhow};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::Semaphore,
    time::{Instant, Interval, MissedTickBehavior, interval, timeout},
};
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Jobs executed concurrently.
    pub slots: usize,
    pub poll_interval: Duration,
    /// Upper bound for one job attempt.
    pub job_timeout: Duration,
    /// How often `running` jobs are checked for abandonment.
    pub reap_interval: Duration,
    /// A `running` job older than this is considered abandoned.
    pub stale_after: Duration,
    /// Enqueue a `deploy:cleanup` this often; `None` disables it.
    pub cleanup_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(15 * 60),
            reap_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(20 * 60),
            cleanup_interval: None,
        }
    }
}

pub struct Worker {
    queue: JobQueue,
    ctx: Arc<JobContext>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: JobQueue, ctx: JobContext, config: WorkerConfig) -> Self {
        Self {
            queue,
            ctx: Arc::new(ctx),
            config,
        }
    }

    /// Poll until `shutdown` resolves, then wait for in-flight jobs.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let slots = self.config.slots.max(1);
        info!(
            slots,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            cleanup = self.config.cleanup_interval.is_some(),
            "worker started"
        );

        let semaphore = Arc::new(Semaphore::new(slots));
        let mut poll = ticker(self.config.poll_interval);
        let mut reaper = ticker(self.config.reap_interval);
        let mut cleanup = self.config.cleanup_interval.map(ticker);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker shutting down");
                    break Ok(());
                }
                _ = reaper.tick() => {
                    match self.queue.reap_stale(self.config.stale_after).await {
                        Ok(reaped) => {
                            if reaped.requeued > 0 {
                                warn!(requeued = reaped.requeued, "requeued abandoned jobs");
                            }
                            if reaped.failed > 0 {
                                error!(failed = reaped.failed, "abandoned jobs out of attempts");
                            }
                        }
                        Err(err) => error!(error = %err, "stale job reaper failed"),
                    }
                }
                _ = tick_optional(&mut cleanup) => {
                    if let Err(err) = self.queue.enqueue(&Job::DeployCleanup { age_in_days: None }).await {
                        error!(error = %err, "failed to schedule deploy cleanup");
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = self.claim_and_dispatch(&semaphore).await {
                        break Err(err);
                    }
                }
            }
        };

        // Every permit back means every spawned job has finished.
        let _ = semaphore.acquire_many(slots as u32).await;
        info!("worker stopped");
        outcome
    }

    /// Claim due jobs while slots are free and spawn them.
    async fn claim_and_dispatch(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("no free slot, skipping claim");
                return Ok(());
            };

            let record = match self.queue.claim_next().await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(err) => {
                    error!(error = %err, "failed to claim job");
                    return Ok(());
                }
            };
            let job = self.decode(&record).await?;

            let queue = self.queue.clone();
            let ctx = self.ctx.clone();
            let job_timeout = self.config.job_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                process(&queue, &ctx, job_timeout, record, job).await;
            });
        }
    }

    /// Run every job that is due right now, one at a time. Returns how many
    /// attempts were made. Jobs rescheduled for later are left alone.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(record) = self.queue.claim_next().await? {
            let job = self.decode(&record).await?;
            process(&self.queue, &self.ctx, self.config.job_timeout, record, job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn decode(&self, record: &JobRecord) -> Result<Job> {
        match record.job() {
            Ok(job) => Ok(job),
            Err(err) => {
                error!(job.id = %record.id, job.name = %record.name, error = %err, "unknown job");
                self.queue.release(record.id).await?;
                Err(anyhow!(
                    "unknown job `{}` ({}): {}",
                    record.name,
                    record.id,
                    err
                ))
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[instrument(
    skip_all,
    fields(job.id = %record.id, job.name = %record.name, attempt = record.attempts)
)]
async fn process(
    queue: &JobQueue,
    ctx: &JobContext,
    job_timeout: Duration,
    record: JobRecord,
    job: Job,
) {
    let start = Instant::now();
    let failure = match timeout(job_timeout, ctx.execute(&job)).await {
        Ok(Ok(result)) => {
            info!(duration_ms = start.elapsed().as_millis() as u64, "job completed");
            match queue.complete(record.id, &result).await {
                Ok(()) => return,
                Err(err) => format!("recording completion failed: {}", err),
            }
        }
        Ok(Err(err)) => format!("{:#}", err),
        Err(_) => format!("timed out after {}s", job_timeout.as_secs()),
    };

    match queue.fail(record.id, &failure).await {
        Ok(FailOutcome::Retrying { run_at }) => {
            warn!(error = %failure, retry_at_ms = run_at, "job failed, will retry");
        }
        Ok(FailOutcome::Failed) => {
            error!(error = %failure, "job failed permanently");
        }
        Err(err) => {
            error!(error = %failure, queue_error = %err, "job failed and could not be rescheduled");
        }
    }
}
