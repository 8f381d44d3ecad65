//! Durable worker queues
//!
//! Items live in the `queue_jobs` table until a handler is done with them. A
//! [`WorkerQueue`] stores items and wakes idle workers; the matching
//! [`QueueReceiver`] is turned into a pool of workers that lease due jobs in
//! batches and hand them to a [`QueueHandler`]. Items the handler gives back
//! are stored again behind an exponential backoff.
//!
//! A leased job that is never settled becomes due again once its lease runs
//! out, and leases left over from a previous run are released at startup, so
//! every item is handled at least once across crashes and restarts.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::data::{Database, NewQueueJob, QueueJob};
use crate::error::AppError;
use crate::metrics::{QUEUE_IN_FLIGHT, QUEUE_PUSHES_TOTAL, QUEUE_RETRIES_TOTAL};

/// Result of handling one batch.
#[derive(Debug)]
pub struct HandleOutcome<T> {
    /// Items finished for good, successfully or not
    pub processed: usize,
    /// Items to hand back to the queue
    pub to_retry: Vec<T>,
}

impl<T> HandleOutcome<T> {
    pub fn new(processed: usize, to_retry: Vec<T>) -> Self {
        Self {
            processed,
            to_retry,
        }
    }
}

/// Processes one batch. Backoff and re-enqueueing are owned by the queue.
#[async_trait]
pub trait QueueHandler<T>: Send + Sync + 'static {
    async fn handle(&self, items: Vec<T>) -> HandleOutcome<T>;
}

pub struct WorkerQueue<T> {
    name: &'static str,
    db: Arc<Database>,
    wake: Arc<Notify>,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            db: self.db.clone(),
            wake: self.wake.clone(),
            _item: PhantomData,
        }
    }
}

impl<T> WorkerQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(name: &'static str, db: Arc<Database>) -> (Self, QueueReceiver<T>) {
        let queue = Self {
            name,
            db,
            wake: Arc::new(Notify::new()),
            _item: PhantomData,
        };
        let receiver = QueueReceiver {
            queue: queue.clone(),
        };
        (queue, receiver)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store an item and wake a worker.
    ///
    /// # Errors
    /// `AppError::Queue` if the item cannot be encoded, or the database error
    /// if it cannot be stored.
    pub async fn push(&self, item: T) -> Result<(), AppError> {
        let job = self.job(&item, 0, now_ms())?;
        self.db.enqueue_job(&job).await?;
        QUEUE_PUSHES_TOTAL.with_label_values(&[self.name]).inc();
        self.wake.notify_one();
        Ok(())
    }

    /// Items stored and not yet settled, leased ones included.
    pub async fn depth(&self) -> Result<i64, AppError> {
        self.db.count_queue_jobs(self.name).await
    }

    fn job(&self, item: &T, attempt: i64, run_at: i64) -> Result<NewQueueJob, AppError> {
        let payload = serde_json::to_string(item).map_err(|e| {
            AppError::Queue(format!("cannot encode item for queue {}: {e}", self.name))
        })?;
        Ok(NewQueueJob {
            queue: self.name.to_string(),
            payload,
            attempt,
            run_at,
        })
    }

    /// How long an idle worker waits before looking again.
    async fn idle_delay(&self, poll_interval: Duration) -> Duration {
        match self.db.next_queue_job_at(self.name).await {
            Ok(Some(run_at)) => {
                let wait = run_at.saturating_sub(now_ms()).max(0) as u64;
                poll_interval.min(Duration::from_millis(wait))
            }
            Ok(None) => poll_interval,
            Err(e) => {
                tracing::warn!(queue = self.name, error = %e, "Failed to look up next job");
                poll_interval
            }
        }
    }
}

pub struct QueueReceiver<T> {
    queue: WorkerQueue<T>,
}

impl<T> QueueReceiver<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start `config.workers` workers feeding `handler`.
    ///
    /// The returned handle completes once every worker has stopped.
    pub fn spawn<H: QueueHandler<T>>(
        self,
        handler: Arc<H>,
        config: &QueueConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.queue;
        let settings = WorkerSettings {
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            lease: Duration::from_secs(config.lease_seconds),
            backoff: Backoff {
                base: Duration::from_millis(config.base_backoff_ms),
                max: Duration::from_secs(config.max_backoff_seconds),
            },
        };
        let workers = config.workers.max(1);

        tokio::spawn(async move {
            match queue.db.release_queue_jobs(queue.name).await {
                Ok(0) => {}
                Ok(released) => tracing::info!(
                    queue = queue.name,
                    released,
                    "Released jobs leased by a previous run"
                ),
                Err(e) => {
                    tracing::warn!(queue = queue.name, error = %e, "Failed to release leased jobs")
                }
            }

            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    tokio::spawn(run_worker(
                        worker,
                        queue.clone(),
                        handler.clone(),
                        settings,
                        shutdown.clone(),
                    ))
                })
                .collect();
            futures::future::join_all(handles).await;
            tracing::info!(queue = queue.name, "Queue workers stopped");
        })
    }

    /// Take everything currently stored, without running a handler.
    #[cfg(test)]
    pub(crate) async fn drain(&mut self) -> Vec<T> {
        let db = &self.queue.db;
        let jobs = db
            .claim_queue_jobs(self.queue.name, 10_000, i64::MAX, 0)
            .await
            .unwrap();
        let ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();
        db.settle_queue_jobs(&ids, &[]).await.unwrap();
        jobs.iter()
            .map(|job| serde_json::from_str(&job.payload).unwrap())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    batch_size: usize,
    poll_interval: Duration,
    lease: Duration,
    backoff: Backoff,
}

async fn run_worker<T, H>(
    worker: usize,
    queue: WorkerQueue<T>,
    handler: Arc<H>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
) where
    T: Serialize + DeserializeOwned + Send + 'static,
    H: QueueHandler<T>,
{
    tracing::debug!(queue = queue.name, worker, "Queue worker started");
    let lease_ms = settings.lease.as_millis() as i64;

    while !shutdown.is_cancelled() {
        let jobs = match queue
            .db
            .claim_queue_jobs(queue.name, settings.batch_size, now_ms(), lease_ms)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(queue = queue.name, error = %e, "Failed to claim jobs");
                Vec::new()
            }
        };

        if jobs.is_empty() {
            let idle = queue.idle_delay(settings.poll_interval).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = queue.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        }

        // more may be waiting; let another idle worker look
        if jobs.len() == settings.batch_size {
            queue.wake.notify_one();
        }
        run_batch(&queue, handler.as_ref(), jobs, &settings).await;
    }

    tracing::debug!(queue = queue.name, worker, "Queue worker exiting");
}

async fn run_batch<T, H>(
    queue: &WorkerQueue<T>,
    handler: &H,
    jobs: Vec<QueueJob>,
    settings: &WorkerSettings,
) where
    T: Serialize + DeserializeOwned + Send + 'static,
    H: QueueHandler<T>,
{
    let ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();
    let attempt = jobs.iter().map(|job| job.attempt).max().unwrap_or(0) + 1;
    let items: Vec<T> = jobs
        .into_iter()
        .filter_map(|job| match serde_json::from_str(&job.payload) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::error!(queue = queue.name, job = job.id, error = %e, "Dropping undecodable job");
                None
            }
        })
        .collect();

    let in_flight = items.len() as i64;
    QUEUE_IN_FLIGHT.add(in_flight);
    let outcome = handler.handle(items).await;
    QUEUE_IN_FLIGHT.sub(in_flight);
    tracing::trace!(
        queue = queue.name,
        processed = outcome.processed,
        retry = outcome.to_retry.len(),
        "Batch handled"
    );

    let mut retries = Vec::with_capacity(outcome.to_retry.len());
    if !outcome.to_retry.is_empty() {
        let delay = settings
            .backoff
            .next(u32::try_from(attempt).unwrap_or(u32::MAX));
        QUEUE_RETRIES_TOTAL
            .with_label_values(&[queue.name])
            .inc_by(outcome.to_retry.len() as u64);
        tracing::debug!(
            queue = queue.name,
            count = outcome.to_retry.len(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        let run_at = now_ms().saturating_add(delay.as_millis() as i64);
        for item in &outcome.to_retry {
            match queue.job(item, attempt, run_at) {
                Ok(job) => retries.push(job),
                Err(e) => tracing::error!(queue = queue.name, error = %e, "Dropping retry"),
            }
        }
    }

    if let Err(e) = queue.db.settle_queue_jobs(&ids, &retries).await {
        // the leases run out and the whole batch is handled again
        tracing::error!(queue = queue.name, count = ids.len(), error = %e, "Failed to settle batch");
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// `base * 2^(attempt-1)`, capped at `max`, plus up to 10% jitter.
    fn next(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(20);
        let delay = self.base.saturating_mul(1u32 << pow).min(self.max);
        let jitter_ms = delay.as_millis() as u64 / 10;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }
}
