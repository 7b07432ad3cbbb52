use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Upper bound on `retry_count`.
pub const MAX_RETRIES: u32 = 3;

/// Externally visible status of a conversion job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Sub-step of a single attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Downloading,
    Converting,
    UploadingResult,
}

impl Phase {
    /// Progress percentage reported when the phase starts.
    pub fn progress(self) -> u8 {
        match self {
            Phase::Downloading => 10,
            Phase::Converting => 30,
            Phase::UploadingResult => 80,
        }
    }
}

/// Work item submitted by a client. Immutable for the lifetime of the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub input_object_key: String,
    pub original_filename: String,
    #[serde(default)]
    pub extract_images: bool,
    pub user_id: Option<String>,
}

/// Result artifact of a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub object_key: String,
    pub filename: String,
    /// Download URL issued at completion time. Clients should ask for a fresh
    /// one via the download endpoint rather than rely on this copy.
    pub download_url: String,
}

/// Error recorded on a job, with a stable kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Status plus the data that is meaningful for that status, and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing {
        progress: u8,
        phase: Phase,
    },
    Retrying {
        progress: u8,
        phase: Phase,
        last_error: JobError,
        retry_at: DateTime<Utc>,
    },
    Succeeded {
        output: JobOutput,
    },
    Failed {
        error: JobError,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobStatus),

    #[error("cannot move from {from} to {to}")]
    Invalid { from: JobStatus, to: JobStatus },

    #[error("progress cannot go backwards ({current}% -> {next}%)")]
    Regression { current: u8, next: u8 },

    #[error("retry budget of {0} exhausted")]
    BudgetExhausted(u32),
}

/// Durable record of a job, as stored in the queue's result backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub payload: JobPayload,
    pub state: JobState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_id: Uuid, payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            payload,
            state: JobState::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Retrying { .. } => JobStatus::Retrying,
            JobState::Succeeded { .. } => JobStatus::Succeeded,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn progress(&self) -> Option<u8> {
        match &self.state {
            JobState::Processing { progress, .. } | JobState::Retrying { progress, .. } => {
                Some(*progress)
            }
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match &self.state {
            JobState::Processing { phase, .. } | JobState::Retrying { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match &self.state {
            JobState::Succeeded { output } => Some(output),
            _ => None,
        }
    }

    pub fn output_object_key(&self) -> Option<&str> {
        self.output().map(|o| o.object_key.as_str())
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.state {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(TransitionError::Terminal(status));
        }
        Ok(())
    }

    /// Move to `Processing` at the given phase.
    ///
    /// `Downloading` starts a new attempt and is the only phase reachable from
    /// `Pending` or `Retrying`. It is also accepted while already processing,
    /// which is what a redelivered job looks like after a worker crash.
    pub fn enter_phase(&mut self, phase: Phase, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        match &self.state {
            JobState::Pending | JobState::Retrying { .. } if phase != Phase::Downloading => {
                return Err(TransitionError::Invalid {
                    from: self.status(),
                    to: JobStatus::Processing,
                });
            }
            JobState::Processing { progress, .. }
                if phase != Phase::Downloading && phase.progress() < *progress =>
            {
                return Err(TransitionError::Regression {
                    current: *progress,
                    next: phase.progress(),
                });
            }
            _ => {}
        }

        self.state = JobState::Processing {
            progress: phase.progress(),
            phase,
        };
        self.updated_at = now;
        Ok(())
    }

    pub fn succeed(&mut self, output: JobOutput, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if !matches!(self.state, JobState::Processing { .. }) {
            return Err(TransitionError::Invalid {
                from: self.status(),
                to: JobStatus::Succeeded,
            });
        }

        self.state = JobState::Succeeded { output };
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.state = JobState::Failed { error };
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// `Processing → Retrying`. Returns the new `retry_count`.
    pub fn schedule_retry(
        &mut self,
        last_error: JobError,
        retry_at: DateTime<Utc>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<u32, TransitionError> {
        self.ensure_live()?;
        let JobState::Processing { progress, phase } = self.state else {
            return Err(TransitionError::Invalid {
                from: self.status(),
                to: JobStatus::Retrying,
            });
        };
        if self.retry_count >= max_retries {
            return Err(TransitionError::BudgetExhausted(max_retries));
        }

        self.retry_count += 1;
        self.state = JobState::Retrying {
            progress,
            phase,
            last_error,
            retry_at,
        };
        self.updated_at = now;
        Ok(self.retry_count)
    }

    /// Returns `false` when the job was already terminal, which is a no-op.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.state = JobState::Cancelled;
        self.updated_at = now;
        self.completed_at = Some(now);
        true
    }
}

/// Status view returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub task_id: Uuid,
    pub status: JobStatus,
    pub filename: String,
    pub progress: Option<u8>,
    pub phase_label: Option<Phase>,
    pub retry_count: u32,
    pub result: Option<JobOutput>,
    pub error: Option<JobError>,
    pub last_error: Option<JobError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_record(record: &JobRecord, cancel_requested: bool) -> Self {
        let last_error = match &record.state {
            JobState::Retrying { last_error, .. } => Some(last_error.clone()),
            _ => None,
        };
        Self {
            task_id: record.job_id,
            status: record.status(),
            filename: record.payload.original_filename.clone(),
            progress: record.progress(),
            phase_label: record.phase(),
            retry_count: record.retry_count,
            result: record.output().cloned(),
            error: record.error().cloned(),
            last_error,
            cancel_requested: cancel_requested && !record.status().is_terminal(),
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

/// Markdown filename for an uploaded document: `report.docx` → `report.md`.
pub fn result_filename(original_filename: &str) -> String {
    let name = original_filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_filename);
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    let stem: String = stem
        .trim()
        .chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect();

    if stem.is_empty() || stem == "." {
        return "document.md".to_string();
    }
    format!("{stem}.md")
}

/// Deterministic result key, so a redelivered job overwrites its own output.
pub fn output_object_key(job_id: Uuid, original_filename: &str) -> String {
    format!("results/{}/{}", job_id, result_filename(original_filename))
}
