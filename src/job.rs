//! Job models and lifecycle state for the conversion queue.

use crate::error::ConversionError;
use crate::source::ConversionSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result delivered to the submitter of a job.
pub type JobResult = Result<Conversion, ConversionError>;

/// A successfully converted artifact.
#[derive(Debug)]
pub struct Conversion {
    pub job_id: String,
    pub bytes: Vec<u8>,
    /// Present when the backend persists artifacts. Reported independently
    /// of the conversion itself.
    pub upload: Option<UploadOutcome>,
}

/// Outcome of storing an artifact after conversion.
#[derive(Debug)]
pub struct UploadOutcome {
    pub key: String,
    pub result: Result<bool, ConversionError>,
}

impl UploadOutcome {
    pub fn label(&self) -> &'static str {
        match self.result {
            Ok(true) => "stored",
            Ok(false) => "declined",
            Err(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One queued conversion.
///
/// A job holds its admission permit for its whole life, so the queue's
/// capacity is released only once the result has been delivered.
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    source: ConversionSource,
    cancel: CancellationToken,
    reply: Option<oneshot::Sender<JobResult>>,
    _permit: OwnedSemaphorePermit,
}

impl Job {
    /// Creates a queued job and the receiver its result will arrive on.
    pub fn new(
        source: ConversionSource,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let now = Utc::now();
        let job = Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            updated_at: now,
            error: None,
            source,
            cancel,
            reply: Some(tx),
            _permit: permit,
        };
        (job, rx)
    }

    pub fn source(&self) -> &ConversionSource {
        &self.source
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn start_processing(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_complete(&mut self) {
        self.status = JobStatus::Complete;
        self.updated_at = Utc::now();
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    pub fn mark_cancelled(&mut self, reason: String) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
        self.error = Some(reason);
    }

    /// Records the terminal state matching `result`.
    pub fn settle(&mut self, result: &JobResult) {
        match result {
            Ok(_) => self.mark_complete(),
            Err(
                e @ (ConversionError::Cancelled
                | ConversionError::ShutdownCancelled
                | ConversionError::ShuttingDown),
            ) => self.mark_cancelled(e.to_string()),
            Err(e) => self.mark_failed(e.to_string()),
        }
    }

    /// Time spent waiting in the queue before a worker claimed the job.
    pub fn queue_wait_ms(&self) -> Option<i64> {
        self.started_at
            .map(|started| started.signed_duration_since(self.created_at).num_milliseconds())
    }

    /// Time spent executing, once the job reached a terminal state.
    pub fn processing_duration_ms(&self) -> Option<i64> {
        match self.status {
            JobStatus::Queued | JobStatus::Processing => None,
            _ => self
                .started_at
                .map(|started| self.updated_at.signed_duration_since(started).num_milliseconds()),
        }
    }

    /// Hands the result to the submitter and releases the job.
    ///
    /// Returns `false` when the submitter has already gone away.
    pub fn deliver(mut self, result: JobResult) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("status", &self.status)
            .field("source", &self.source)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Format;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn test_job() -> (Job, oneshot::Receiver<JobResult>, Arc<Semaphore>) {
        let admission = Arc::new(Semaphore::new(1));
        let permit = admission.clone().try_acquire_owned().unwrap();
        let (job, rx) = Job::new(
            ConversionSource::new("http://example.com", Format::Pdf),
            CancellationToken::new(),
            permit,
        );
        (job, rx, admission)
    }

    #[test]
    fn test_job_creation() {
        let (job, _rx, _admission) = test_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none());
        assert!(job.error.is_none());
        assert!(job.processing_duration_ms().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let (mut job, _rx, _admission) = test_job();

        job.start_processing();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.queue_wait_ms().is_some());
        assert!(job.processing_duration_ms().is_none());

        job.mark_complete();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.processing_duration_ms().is_some());
    }

    #[test]
    fn settle_classifies_cancellation_separately() {
        let (mut job, _rx, _admission) = test_job();
        job.start_processing();

        job.settle(&Err(ConversionError::ShutdownCancelled));
        assert_eq!(job.status, JobStatus::Cancelled);

        job.settle(&Err(ConversionError::Timeout(std::time::Duration::from_secs(1))));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn deliver_releases_permit() {
        let (job, rx, admission) = test_job();
        assert_eq!(admission.available_permits(), 0);

        let job_id = job.job_id.clone();
        let delivered = job.deliver(Ok(Conversion {
            job_id: job_id.clone(),
            bytes: b"%PDF".to_vec(),
            upload: None,
        }));

        assert!(delivered);
        assert_eq!(admission.available_permits(), 1);
        let conversion = rx.await.unwrap().unwrap();
        assert_eq!(conversion.job_id, job_id);
    }

    #[test]
    fn deliver_to_departed_submitter() {
        let (job, rx, _admission) = test_job();
        drop(rx);
        assert!(!job.deliver(Err(ConversionError::Cancelled)));
    }
}
