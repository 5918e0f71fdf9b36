//! Bounded in-process work queue for conversion jobs.

use crate::converter::{Converter, Persist};
use crate::error::ConversionError;
use crate::job::{Conversion, Job, JobResult, UploadOutcome};
use crate::source::ConversionSource;
use crate::telemetry;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Record a heartbeat every this many finished jobs.
const HEARTBEAT_INTERVAL: usize = 10;

/// Capacity and deadline settings for a [`WorkQueue`].
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Number of jobs that may execute at once. Must be non-zero.
    pub max_workers: usize,
    /// Number of jobs that may wait for a free worker.
    pub max_queue: usize,
    /// Deadline for each job, measured from the moment a worker claims it.
    pub worker_timeout: Duration,
}

/// Point-in-time view of the queue, served by `GET /stats`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub max_workers: usize,
    pub max_queue: usize,
    pub queued: usize,
    pub active: usize,
    pub peak_active: usize,
    pub completed: usize,
    pub failed: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    /// `completed + failed`, bumped once per job so heartbeats fire exactly once.
    finished: AtomicUsize,
    rejected: AtomicUsize,
}

/// State shared by every worker task.
struct WorkerContext {
    converter: Arc<dyn Converter>,
    worker_timeout: Duration,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    settings: QueueSettings,
}

/// A fixed pool of workers fed by a bounded FIFO queue.
///
/// Admission never blocks: once `max_workers + max_queue` jobs are in the
/// system, [`WorkQueue::submit`] fails with [`ConversionError::QueueFull`].
pub struct WorkQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    counters: Arc<Counters>,
    settings: QueueSettings,
}

impl WorkQueue {
    /// Spawns `settings.max_workers` workers on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is zero or if called outside a tokio runtime.
    pub fn start(settings: QueueSettings, converter: Arc<dyn Converter>) -> Self {
        assert!(settings.max_workers > 0, "max_workers must be non-zero");

        let capacity = settings.max_workers + settings.max_queue;
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let ctx = Arc::new(WorkerContext {
            converter,
            worker_timeout: settings.worker_timeout,
            shutdown: shutdown.clone(),
            counters: counters.clone(),
            settings,
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..settings.max_workers {
            workers.spawn(worker_loop(worker_id, rx.clone(), ctx.clone()));
        }

        info!(
            max_workers = settings.max_workers,
            max_queue = settings.max_queue,
            worker_timeout_secs = settings.worker_timeout.as_secs_f64(),
            "Work queue started"
        );

        Self {
            sender: Mutex::new(Some(tx)),
            admission: Arc::new(Semaphore::new(capacity)),
            shutdown,
            workers: tokio::sync::Mutex::new(workers),
            counters,
            settings,
        }
    }

    /// Queues a conversion and waits for its result.
    ///
    /// Fails immediately with [`ConversionError::QueueFull`] when the queue
    /// is saturated and with [`ConversionError::ShuttingDown`] once
    /// [`WorkQueue::drain`] has begun. Dropping the returned future cancels
    /// the job.
    pub async fn submit(&self, source: ConversionSource) -> JobResult {
        let (job_id, cancel, reply) = {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(ConversionError::ShuttingDown)?;

            let permit = match self.admission.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(uri = %source.actual_uri(), "Rejecting conversion: queue is full");
                    return Err(ConversionError::QueueFull);
                }
            };

            let (job, reply) = Job::new(source, self.shutdown.child_token(), permit);
            let job_id = job.job_id.clone();
            let cancel = job.cancel_token().clone();

            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = sender.try_send(job) {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                return Err(match e {
                    TrySendError::Full(_) => ConversionError::QueueFull,
                    TrySendError::Closed(_) => ConversionError::ShuttingDown,
                });
            }
            (job_id, cancel, reply)
        };

        debug!(job_id = %job_id, "Enqueued conversion job");

        // Cancels the job if the caller stops waiting for it.
        let guard = cancel.drop_guard();
        let result = reply.await.unwrap_or(Err(ConversionError::ShutdownCancelled));
        guard.disarm();
        result
    }

    /// Stops admitting jobs, gives queued and running jobs up to `grace` to
    /// finish, then cancels whatever is left and waits for the workers.
    pub async fn drain(&self, grace: Duration) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            info!(grace_secs = grace.as_secs_f64(), "Draining work queue");
        }
        // Workers exit once the channel is closed and empty.
        drop(sender);

        let mut workers = self.workers.lock().await;
        let finished = tokio::time::timeout(grace, join_all(&mut workers)).await;
        if finished.is_err() {
            warn!(
                queued = self.counters.queued.load(Ordering::Relaxed),
                active = self.counters.active.load(Ordering::Relaxed),
                "Grace period elapsed, cancelling outstanding jobs"
            );
            self.shutdown.cancel();
            join_all(&mut workers).await;
        }
        info!("Work queue drained");
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    pub fn stats(&self) -> QueueStats {
        snapshot(&self.counters, &self.settings)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn snapshot(counters: &Counters, settings: &QueueSettings) -> QueueStats {
    QueueStats {
        max_workers: settings.max_workers,
        max_queue: settings.max_queue,
        queued: counters.queued.load(Ordering::Relaxed),
        active: counters.active.load(Ordering::Relaxed),
        peak_active: counters.peak_active.load(Ordering::Relaxed),
        completed: counters.completed.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        rejected: counters.rejected.load(Ordering::Relaxed),
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "Worker task failed");
        }
    }
}

/// Pulls jobs in FIFO order until the queue is closed and empty.
async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    ctx: Arc<WorkerContext>,
) {
    debug!(worker_id, "Worker started");

    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(mut job) = job else { break };
        ctx.counters.queued.fetch_sub(1, Ordering::Relaxed);

        if ctx.shutdown.is_cancelled() {
            finish(job_skipped(&mut job, ConversionError::ShutdownCancelled), job, &ctx);
            continue;
        }
        if job.cancel_token().is_cancelled() {
            debug!(job_id = %job.job_id, "Skipping job abandoned by its submitter");
            finish(job_skipped(&mut job, ConversionError::Cancelled), job, &ctx);
            continue;
        }

        process_job(worker_id, job, &ctx).await;
    }

    debug!(worker_id, "Worker stopped");
}

fn job_skipped(job: &mut Job, err: ConversionError) -> JobResult {
    job.start_processing();
    Err(err)
}

/// Runs one job under its deadline and delivers the result.
async fn process_job(worker_id: usize, mut job: Job, ctx: &WorkerContext) {
    info!(
        job_id = %job.job_id,
        worker_id,
        format = %job.source().format(),
        uri = %job.source().actual_uri(),
        "Processing conversion job"
    );

    job.start_processing();
    let active = ctx.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.counters.peak_active.fetch_max(active, Ordering::SeqCst);

    let result = execute(&job, ctx).await;

    ctx.counters.active.fetch_sub(1, Ordering::SeqCst);
    finish(result, job, ctx);
}

fn finish(result: JobResult, mut job: Job, ctx: &WorkerContext) {
    job.settle(&result);
    match &result {
        Ok(conversion) => {
            ctx.counters.completed.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %job.job_id,
                bytes = conversion.bytes.len(),
                duration_ms = ?job.processing_duration_ms(),
                "Conversion job completed"
            );
        }
        Err(e) => {
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(job_id = %job.job_id, error = %e, "Conversion job failed");
        }
    }
    telemetry::record_job_telemetry(&job);

    let finished = ctx.counters.finished.fetch_add(1, Ordering::Relaxed) + 1;
    if heartbeat_due(finished) {
        telemetry::record_worker_heartbeat(&snapshot(&ctx.counters, &ctx.settings));
    }

    let job_id = job.job_id.clone();
    if !job.deliver(result) {
        debug!(job_id = %job_id, "Submitter went away before the result was ready");
    }
}

/// Converts, then uploads if the backend persists artifacts. Both steps
/// share one deadline that starts here.
async fn execute(job: &Job, ctx: &WorkerContext) -> JobResult {
    let token = job.cancel_token().clone();
    let deadline = tokio::time::sleep(ctx.worker_timeout);
    tokio::pin!(deadline);

    let convert = ctx.converter.convert(job.source(), token.clone());
    tokio::pin!(convert);

    let converted = tokio::select! {
        res = &mut convert => Some(res),
        _ = &mut deadline => None,
    };
    let converted = match converted {
        Some(res) => res,
        None => {
            warn!(job_id = %job.job_id, timeout = ?ctx.worker_timeout, "Conversion deadline elapsed");
            token.cancel();
            // The converter must unwind promptly once cancelled.
            let _ = convert.await;
            return Err(ConversionError::Timeout(ctx.worker_timeout));
        }
    };

    let bytes = match converted {
        Ok(bytes) => bytes,
        Err(ConversionError::Cancelled) if ctx.shutdown.is_cancelled() => {
            return Err(ConversionError::ShutdownCancelled)
        }
        Err(e) => return Err(e),
    };

    let upload = match ctx.converter.persistence() {
        Some(store) => {
            let key = upload_key(job);
            let result = upload(store, &key, &bytes, deadline.as_mut(), &token).await;
            if let Err(e) = &result {
                warn!(job_id = %job.job_id, key = %key, error = %e, "Artifact upload failed");
            }
            Some(UploadOutcome { key, result })
        }
        None => None,
    };

    Ok(Conversion {
        job_id: job.job_id.clone(),
        bytes,
        upload,
    })
}

fn heartbeat_due(finished: usize) -> bool {
    finished % HEARTBEAT_INTERVAL == 0
}

fn upload_key(job: &Job) -> String {
    match job.source().upload_key() {
        Some(key) => key.to_string(),
        None => format!("{}.{}", job.job_id, job.source().format().extension()),
    }
}

async fn upload(
    store: &dyn Persist,
    key: &str,
    bytes: &[u8],
    deadline: Pin<&mut Sleep>,
    cancel: &CancellationToken,
) -> Result<bool, ConversionError> {
    let failed = |reason: &str| ConversionError::UploadFailed {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    tokio::select! {
        res = store.upload(key, bytes) => res,
        _ = deadline => Err(failed("deadline elapsed")),
        _ = cancel.cancelled() => Err(failed("cancelled")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MockPersist;
    use crate::source::Format;
    use async_trait::async_trait;

    /// Returns the URI as bytes, or fails when the URI says so.
    struct EchoConverter {
        store: Option<Arc<dyn Persist>>,
    }

    #[async_trait]
    impl Converter for EchoConverter {
        async fn convert(
            &self,
            source: &ConversionSource,
            _cancel: CancellationToken,
        ) -> Result<Vec<u8>, ConversionError> {
            if source.uri() == "fail" {
                return Err(ConversionError::ProcessFailed {
                    command: "echo".to_string(),
                    status: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            Ok(source.uri().as_bytes().to_vec())
        }

        fn persistence(&self) -> Option<&dyn Persist> {
            self.store.as_deref()
        }
    }

    /// Never finishes an upload in time.
    struct StalledStore;

    #[async_trait]
    impl Persist for StalledStore {
        async fn upload(&self, _key: &str, _payload: &[u8]) -> Result<bool, ConversionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        }
    }

    fn stalled_upload_reason(conversion: &Conversion) -> String {
        match &conversion.upload {
            Some(UploadOutcome {
                result: Err(ConversionError::UploadFailed { reason, .. }),
                ..
            }) => reason.clone(),
            other => panic!("expected a failed upload, got {other:?}"),
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            max_workers: 2,
            max_queue: 2,
            worker_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_bytes() {
        let queue = WorkQueue::start(settings(), Arc::new(EchoConverter { store: None }));

        let conversion = queue
            .submit(ConversionSource::new("hello", Format::Pdf))
            .await
            .unwrap();

        assert_eq!(conversion.bytes, b"hello");
        assert!(conversion.upload.is_none());
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_upload_after_successful_convert() {
        let mut store = MockPersist::new();
        store
            .expect_upload()
            .withf(|key, payload| key == "report.pdf" && payload == b"hello")
            .times(1)
            .returning(|_, _| Ok(true));

        let converter = EchoConverter {
            store: Some(Arc::new(store)),
        };
        let queue = WorkQueue::start(settings(), Arc::new(converter));

        let conversion = queue
            .submit(ConversionSource::new("hello", Format::Pdf).with_upload_key("report.pdf"))
            .await
            .unwrap();

        let upload = conversion.upload.unwrap();
        assert_eq!(upload.key, "report.pdf");
        assert!(matches!(upload.result, Ok(true)));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_bytes() {
        let mut store = MockPersist::new();
        store.expect_upload().times(1).returning(|key, _| {
            Err(ConversionError::UploadFailed {
                key: key.to_string(),
                reason: "bucket unavailable".to_string(),
            })
        });

        let converter = EchoConverter {
            store: Some(Arc::new(store)),
        };
        let queue = WorkQueue::start(settings(), Arc::new(converter));

        let conversion = queue
            .submit(ConversionSource::new("hello", Format::Png))
            .await
            .unwrap();

        assert_eq!(conversion.bytes, b"hello");
        let upload = conversion.upload.unwrap();
        assert!(upload.key.ends_with(".png"));
        assert!(matches!(upload.result, Err(ConversionError::UploadFailed { .. })));
        assert_eq!(upload.label(), "failed");
    }

    #[tokio::test]
    async fn test_no_upload_when_convert_fails() {
        let mut store = MockPersist::new();
        store.expect_upload().times(0);

        let converter = EchoConverter {
            store: Some(Arc::new(store)),
        };
        let queue = WorkQueue::start(settings(), Arc::new(converter));

        let err = queue
            .submit(ConversionSource::new("fail", Format::Pdf))
            .await
            .unwrap_err();

        assert!(matches!(err, ConversionError::ProcessFailed { .. }));
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_submit_after_drain_is_rejected() {
        let queue = WorkQueue::start(settings(), Arc::new(EchoConverter { store: None }));
        queue.drain(Duration::from_secs(1)).await;

        let err = queue
            .submit(ConversionSource::new("late", Format::Pdf))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::ShuttingDown));

        // A second drain is a no-op.
        queue.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_deadline_during_upload_keeps_bytes() {
        let converter = EchoConverter {
            store: Some(Arc::new(StalledStore)),
        };
        let queue = WorkQueue::start(
            QueueSettings {
                worker_timeout: Duration::from_millis(200),
                ..settings()
            },
            Arc::new(converter),
        );

        let started = std::time::Instant::now();
        let conversion = queue
            .submit(ConversionSource::new("x", Format::Pdf))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conversion.bytes, b"x");
        assert_eq!(conversion.upload.as_ref().unwrap().label(), "failed");
        assert_eq!(stalled_upload_reason(&conversion), "deadline elapsed");
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_upload_keeps_bytes() {
        let converter = EchoConverter {
            store: Some(Arc::new(StalledStore)),
        };
        let queue = Arc::new(WorkQueue::start(
            QueueSettings {
                worker_timeout: Duration::from_secs(30),
                ..settings()
            },
            Arc::new(converter),
        ));

        let pending = tokio::spawn({
            let queue = queue.clone();
            async move { queue.submit(ConversionSource::new("x", Format::Png)).await }
        });
        while queue.stats().active == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        queue.drain(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let conversion = pending.await.unwrap().unwrap();
        assert_eq!(conversion.bytes, b"x");
        assert_eq!(stalled_upload_reason(&conversion), "cancelled");
    }

    #[tokio::test]
    async fn test_every_finished_job_is_counted_once() {
        let queue = WorkQueue::start(settings(), Arc::new(EchoConverter { store: None }));

        for i in 0..HEARTBEAT_INTERVAL {
            let uri = if i % 3 == 0 { "fail" } else { "ok" };
            let _ = queue.submit(ConversionSource::new(uri, Format::Pdf)).await;
        }

        let stats = queue.stats();
        assert_eq!(stats.completed + stats.failed, HEARTBEAT_INTERVAL);
        assert_eq!(queue.counters.finished.load(Ordering::Relaxed), HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_heartbeat_due_on_interval() {
        assert!(!heartbeat_due(1));
        assert!(!heartbeat_due(HEARTBEAT_INTERVAL - 1));
        assert!(heartbeat_due(HEARTBEAT_INTERVAL));
        assert!(heartbeat_due(HEARTBEAT_INTERVAL * 3));
    }
}
