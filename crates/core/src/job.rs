//! Job lifecycle model.
//!
//! A [`Job`] moves strictly forward through
//! `pending -> processing -> {completed | failed}`. Each timestamp is set
//! exactly once and the outcome is populated only on the terminal
//! transition.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::params::EditParams;
use crate::types::{ChatRef, JobId, Timestamp};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where progress updates and results for a job are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// The requesting user.
    pub user_id: ChatRef,
    /// Chat or channel that receives the result.
    pub chat_id: ChatRef,
    /// Status message that is edited in place with progress.
    pub message_id: ChatRef,
}

/// Terminal result of processing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobOutcome {
    Success { result_path: PathBuf },
    Failure { error: String },
}

impl JobOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One user-initiated image edit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: DeliveryTarget,
    /// Local path of the input image.
    pub image_path: PathBuf,
    pub params: EditParams,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub outcome: Option<JobOutcome>,
}

impl Job {
    /// Create a new pending job with a fresh id.
    pub fn new(target: DeliveryTarget, image_path: impl Into<PathBuf>, params: EditParams) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            target,
            image_path: image_path.into(),
            params,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outcome: None,
        }
    }

    /// First eight characters of the id, used in log lines and messages.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn user_id(&self) -> ChatRef {
        self.target.user_id
    }

    /// Transition `pending -> processing`. No-op on any other state.
    pub fn mark_started(&mut self, now: Timestamp) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Processing;
            self.started_at = Some(now);
        }
    }

    /// Transition `processing -> completed | failed` and store the outcome.
    /// No-op when the job is already terminal.
    pub fn finish(&mut self, outcome: JobOutcome, now: Timestamp) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if outcome.is_success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.completed_at = Some(now);
        self.outcome = Some(outcome);
    }

    pub fn result_path(&self) -> Option<&Path> {
        match &self.outcome {
            Some(JobOutcome::Success { result_path }) => Some(result_path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(JobOutcome::Failure { error }) => Some(error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
