//! Worker-side job state machine.
//!
//! One attempt walks `downloading (10%) → converting (30%) →
//! uploading_result (80%)` and ends in `Succeeded`. A failed attempt is
//! classified as retryable or fatal; retryable failures are rescheduled with
//! linear backoff until the retry budget is spent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::job::{
    output_object_key, result_filename, JobError, JobOutput, JobRecord, JobStatus, Phase,
    TransitionError, MAX_RETRIES,
};
use crate::services::converter::{
    convert_bytes, file_extension, is_supported, ConversionError, ConvertOptions, Converter,
};
use crate::services::queue::{JobBackend, QueueError};
use crate::services::storage::{StorageError, StorageGateway};

pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown";

/// Linear backoff: the n-th retry waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn linear() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_secs(60),
        }
    }

    /// Delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay * retry_count
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear()
    }
}

/// The soft limit aborts an attempt and records a retryable failure. The hard
/// limit is the lease on a claimed job: past it, the job is redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(25 * 60),
            hard: Duration::from_secs(30 * 60),
        }
    }
}

/// Why an attempt did not produce a result.
#[derive(Debug)]
pub enum AttemptError {
    /// Transient: storage hiccup, converter crash, soft time limit.
    Retryable(JobError),
    /// Retrying cannot help (unsupported input).
    Fatal(JobError),
    /// A cancellation request was observed.
    Cancelled,
    /// The queue backend itself failed; the job stays claimed and is
    /// redelivered once its lease expires.
    Backend(QueueError),
    Invariant(TransitionError),
}

impl From<StorageError> for AttemptError {
    fn from(err: StorageError) -> Self {
        let kind = match err {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Storage,
        };
        AttemptError::Retryable(JobError::new(kind, err.to_string()))
    }
}

impl From<ConversionError> for AttemptError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::Unsupported(_) => {
                AttemptError::Fatal(JobError::new(ErrorKind::Validation, err.to_string()))
            }
            other => AttemptError::Retryable(JobError::new(ErrorKind::Conversion, other.to_string())),
        }
    }
}

impl From<QueueError> for AttemptError {
    fn from(err: QueueError) -> Self {
        AttemptError::Backend(err)
    }
}

impl From<TransitionError> for AttemptError {
    fn from(err: TransitionError) -> Self {
        AttemptError::Invariant(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Invalid job transition: {0}")]
    Transition(#[from] TransitionError),
}

/// A job claimed and handled by [`JobRunner::process_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub job_id: Uuid,
    /// `None` when the record had expired or been deleted.
    pub status: Option<JobStatus>,
}

pub struct JobRunner {
    backend: Arc<dyn JobBackend>,
    storage: StorageGateway,
    converter: Arc<dyn Converter>,
    retry: RetryPolicy,
    limits: TimeLimits,
}

impl JobRunner {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        storage: StorageGateway,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            backend,
            storage,
            converter,
            retry: RetryPolicy::default(),
            limits: TimeLimits::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_time_limits(mut self, limits: TimeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Claim the next due job and drive it to its next resting state.
    /// Returns `Ok(None)` when nothing is due.
    pub async fn process_next(&self) -> Result<Option<Processed>, RunError> {
        let Some(job_id) = self.backend.claim(self.limits.hard).await? else {
            return Ok(None);
        };

        let status = self.run(job_id).await?;
        self.backend.ack(job_id).await?;
        Ok(Some(Processed { job_id, status }))
    }

    /// Process jobs until none is due.
    pub async fn drain(&self) -> Result<Vec<Processed>, RunError> {
        let mut processed = Vec::new();
        while let Some(p) = self.process_next().await? {
            processed.push(p);
        }
        Ok(processed)
    }

    #[tracing::instrument(name = "job.run", skip_all, fields(job_id = %job_id))]
    async fn run(&self, job_id: Uuid) -> Result<Option<JobStatus>, RunError> {
        let Some(mut record) = self.backend.load(job_id).await? else {
            tracing::warn!("Claimed job has no record (expired or deleted), dropping it");
            return Ok(None);
        };

        let status = record.status();
        if status.is_terminal() {
            tracing::info!(status = %status, "Redelivered job is already finished");
            return Ok(Some(status));
        }

        tracing::info!(
            input_object_key = %record.payload.input_object_key,
            filename = %record.payload.original_filename,
            retry_count = record.retry_count,
            "Processing conversion job"
        );

        let started = Instant::now();
        let outcome = match self.advance(&mut record, Phase::Downloading).await {
            Ok(()) => match tokio::time::timeout(self.limits.soft, self.attempt(&mut record)).await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Retryable(JobError::new(
                    ErrorKind::Conversion,
                    format!("soft time limit of {:?} exceeded", self.limits.soft),
                ))),
            },
            Err(e) => Err(e),
        };

        let status = self.settle(record, outcome).await?;
        metrics::histogram!("conversion_processing_seconds").record(started.elapsed().as_secs_f64());
        Ok(status)
    }

    /// One attempt, from the downloaded input to the uploaded result.
    async fn attempt(&self, record: &mut JobRecord) -> Result<JobOutput, AttemptError> {
        let job_id = record.job_id;
        let payload = record.payload.clone();

        let extension = file_extension(&payload.original_filename)
            .filter(|_| is_supported(&payload.original_filename))
            .ok_or_else(|| ConversionError::Unsupported(payload.original_filename.clone()))?;

        tracing::debug!(object_key = %payload.input_object_key, "Downloading input");
        let bytes = self.storage.get(&payload.input_object_key).await?;

        self.advance(record, Phase::Converting).await?;
        let convert_started = Instant::now();
        let markdown = convert_bytes(
            self.converter.as_ref(),
            bytes,
            extension,
            ConvertOptions {
                extract_images: payload.extract_images,
            },
        )
        .await?;
        tracing::info!(
            convert_ms = convert_started.elapsed().as_millis() as u64,
            markdown_bytes = markdown.len(),
            "Conversion complete"
        );

        self.advance(record, Phase::UploadingResult).await?;
        let object_key = output_object_key(job_id, &payload.original_filename);
        self.storage
            .put(&object_key, markdown.as_bytes(), MARKDOWN_CONTENT_TYPE)
            .await?;

        let filename = result_filename(&payload.original_filename);
        let download_url = self.storage.issue_download_url(&object_key, &filename).await?;

        Ok(JobOutput {
            object_key,
            filename,
            download_url,
        })
    }

    /// Enter `phase` unless the job was cancelled, and publish the progress.
    async fn advance(&self, record: &mut JobRecord, phase: Phase) -> Result<(), AttemptError> {
        if self.backend.is_revoked(record.job_id).await? {
            return Err(AttemptError::Cancelled);
        }
        record.enter_phase(phase, Utc::now())?;
        self.backend.store(record).await?;
        tracing::debug!(phase = %phase, progress = phase.progress(), "Phase started");
        Ok(())
    }

    /// Turn an attempt outcome into the job's next state.
    async fn settle(
        &self,
        mut record: JobRecord,
        outcome: Result<JobOutput, AttemptError>,
    ) -> Result<Option<JobStatus>, RunError> {
        let job_id = record.job_id;

        if self.backend.is_revoked(job_id).await? {
            if let Ok(output) = &outcome {
                if let Err(e) = self.storage.delete(&output.object_key).await {
                    tracing::warn!(object_key = %output.object_key, error = %e, "Failed to remove result of cancelled job");
                }
            }
            return self.finish_cancelled(record).await;
        }

        let now = Utc::now();
        match outcome {
            Ok(output) => {
                record.succeed(output, now)?;
                self.backend.store(&record).await?;
                metrics::counter!("conversion_jobs_completed").increment(1);
                tracing::info!(
                    output_object_key = record.output_object_key().unwrap_or_default(),
                    retry_count = record.retry_count,
                    "Job completed successfully"
                );
            }
            Err(AttemptError::Retryable(error)) if record.retry_count < self.retry.max_retries => {
                let delay = self.retry.delay_for(record.retry_count + 1);
                let retry_at = now + chrono::Duration::seconds(delay.as_secs() as i64);
                tracing::warn!(error = %error, delay_secs = delay.as_secs(), "Attempt failed, retry scheduled");

                let retry_count =
                    record.schedule_retry(error, retry_at, self.retry.max_retries, now)?;
                self.backend.store(&record).await?;
                self.backend.push(job_id, Some(retry_at)).await?;
                metrics::counter!("conversion_jobs_retried").increment(1);
                tracing::info!(retry_count, "Job re-queued for retry");
            }
            Err(AttemptError::Retryable(error)) => {
                let exhausted = JobError::new(
                    ErrorKind::Exhausted,
                    format!(
                        "Conversion failed after {} retries: {}",
                        record.retry_count, error.message
                    ),
                );
                record.fail(exhausted, now)?;
                self.backend.store(&record).await?;
                metrics::counter!("conversion_jobs_failed").increment(1);
                tracing::warn!(retry_count = record.retry_count, error = %error, "Job failed after max retries");
            }
            Err(AttemptError::Fatal(error)) => {
                tracing::warn!(error = %error, "Job failed permanently");
                record.fail(error, now)?;
                self.backend.store(&record).await?;
                metrics::counter!("conversion_jobs_failed").increment(1);
            }
            Err(AttemptError::Cancelled) => return self.finish_cancelled(record).await,
            Err(AttemptError::Backend(e)) => return Err(e.into()),
            Err(AttemptError::Invariant(e)) => return Err(e.into()),
        }

        Ok(Some(record.status()))
    }

    async fn finish_cancelled(&self, mut record: JobRecord) -> Result<Option<JobStatus>, RunError> {
        // A deleted job has no record left; writing one back would resurrect it.
        if self.backend.load(record.job_id).await?.is_none() {
            tracing::info!("Job was deleted while queued or running");
            return Ok(None);
        }

        record.cancel(Utc::now());
        self.backend.store(&record).await?;
        tracing::info!("Job cancelled");
        Ok(Some(record.status()))
    }
}
