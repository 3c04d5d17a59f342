//! Bounded FIFO job queue with a single in-flight slot and a result history.
//!
//! All state lives behind one [`Mutex`]; every operation takes the lock once,
//! so `enqueue`, `dequeue`, `complete` and cancellation never interleave.
//! `dequeue` hands out a job only while no other job is current, which keeps
//! at most one job in flight even if a second consumer ever appears.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use editbot_core::job::{Job, JobOutcome, JobStatus};
use editbot_core::types::{ChatRef, JobId, Timestamp};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending jobs.
    pub max_size: usize,
    /// Maximum number of terminal jobs kept in history.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            history_limit: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    /// `complete` was called with a job that is not the current one.
    #[error("Queue invariant violated: completed job {got}, current is {expected:?}")]
    InvariantViolation { expected: Option<JobId>, got: JobId },
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub capacity: usize,
    pub current_job: Option<JobId>,
    pub completed_today: usize,
    pub total_completed: u64,
    /// Percentage of successful jobs in history, `0.0` when history is empty.
    pub success_rate: f64,
}

/// Result of a per-user cancel request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The pending job was removed from the queue.
    Cancelled(Job),
    /// The user's job is already being processed and cannot be cancelled.
    Processing(JobId),
    NotFound,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    current: Option<Job>,
    history: VecDeque<Job>,
    total_completed: u64,
}

pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        tracing::info!(max_size = config.max_size, "Job queue created");
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    /// Append a job and return its 1-based position among pending jobs.
    pub async fn enqueue(&self, job: Job) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        if state.pending.len() >= self.config.max_size {
            tracing::warn!(job_id = %job.id, capacity = self.config.max_size, "Queue full, job rejected");
            return Err(QueueError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        tracing::info!(job_id = %job.id, user_id = job.user_id(), "Job enqueued");
        state.pending.push_back(job);
        let position = state.pending.len();
        drop(state);

        self.available.notify_one();
        Ok(position)
    }

    /// Wait for the next pending job, mark it started and make it current.
    ///
    /// Cancel-safe: a job is only removed from the queue in the same poll
    /// that returns it.
    pub async fn dequeue(&self) -> Job {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.current.is_none() {
                    if let Some(mut job) = state.pending.pop_front() {
                        job.mark_started(Utc::now());
                        state.current = Some(job.clone());
                        tracing::info!(job_id = %job.id, remaining = state.pending.len(), "Job dequeued");
                        return job;
                    }
                }
            }
            self.available.notified().await;
        }
    }

    /// Record the outcome of the current job and move it to history.
    pub async fn complete(&self, mut job: Job, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        let expected = state.current.as_ref().map(|c| c.id);
        if expected != Some(job.id) {
            tracing::error!(job_id = %job.id, current = ?expected, "Completed job is not the current job");
            return Err(QueueError::InvariantViolation {
                expected,
                got: job.id,
            });
        }

        job.finish(outcome, Utc::now());
        match job.status {
            JobStatus::Completed => tracing::info!(job_id = %job.id, "Job completed"),
            _ => tracing::warn!(job_id = %job.id, error = job.error().unwrap_or_default(), "Job failed"),
        }

        state.current = None;
        state.total_completed += 1;
        state.history.push_back(job);
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        drop(state);

        // A pending job may have been waiting for the slot to free up.
        self.available.notify_one();
        Ok(())
    }

    pub async fn status(&self) -> QueueStatus {
        self.status_at(Utc::now()).await
    }

    /// Status with "completed today" evaluated against `now`'s UTC date.
    pub async fn status_at(&self, now: Timestamp) -> QueueStatus {
        let state = self.state.lock().await;
        let today = now.date_naive();

        let completed_today = state
            .history
            .iter()
            .filter(|j| j.completed_at.is_some_and(|t| t.date_naive() == today))
            .count();
        let successes = state
            .history
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        let success_rate = if state.history.is_empty() {
            0.0
        } else {
            100.0 * successes as f64 / state.history.len() as f64
        };

        QueueStatus {
            queue_size: state.pending.len(),
            capacity: self.config.max_size,
            current_job: state.current.as_ref().map(|j| j.id),
            completed_today,
            total_completed: state.total_completed,
            success_rate,
        }
    }

    /// The user's current or pending job, if any.
    pub async fn find_by_user(&self, user_id: ChatRef) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .current
            .iter()
            .chain(state.pending.iter())
            .find(|j| j.user_id() == user_id)
            .cloned()
    }

    /// Remove a pending job by id. The current job is never removed.
    pub async fn cancel_pending(&self, job_id: JobId) -> Option<Job> {
        let mut state = self.state.lock().await;
        let index = state.pending.iter().position(|j| j.id == job_id)?;
        let job = state.pending.remove(index);
        if let Some(job) = &job {
            tracing::info!(job_id = %job.id, "Pending job cancelled");
        }
        job
    }

    /// Cancel the user's pending job, unless their job is already running.
    pub async fn cancel_for_user(&self, user_id: ChatRef) -> CancelOutcome {
        let mut state = self.state.lock().await;

        if let Some(current) = state.current.as_ref().filter(|j| j.user_id() == user_id) {
            return CancelOutcome::Processing(current.id);
        }

        match state.pending.iter().position(|j| j.user_id() == user_id) {
            Some(index) => match state.pending.remove(index) {
                Some(job) => {
                    tracing::info!(job_id = %job.id, user_id, "Pending job cancelled by user");
                    CancelOutcome::Cancelled(job)
                }
                None => CancelOutcome::NotFound,
            },
            None => CancelOutcome::NotFound,
        }
    }

    /// Drop history entries that completed more than `max_age` ago.
    /// Returns the number of entries removed.
    pub async fn prune_history(&self, max_age: TimeDelta) -> usize {
        self.prune_history_at(max_age, Utc::now()).await
    }

    pub async fn prune_history_at(&self, max_age: TimeDelta, now: Timestamp) -> usize {
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return 0;
        };
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state
            .history
            .retain(|j| j.completed_at.is_some_and(|t| t >= cutoff));
        let removed = before - state.history.len();
        if removed > 0 {
            tracing::info!(removed, "Pruned old history entries");
        }
        removed
    }

    /// Terminal jobs, oldest first.
    pub async fn history(&self) -> Vec<Job> {
        self.state.lock().await.history.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Periodic pruning
// ---------------------------------------------------------------------------

/// Background task dropping terminal jobs older than `max_age`.
pub struct HistoryPruner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HistoryPruner {
    /// Prune every `every`, starting one interval from now.
    pub fn spawn(queue: Arc<JobQueue>, max_age: TimeDelta, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(prune_loop(queue, max_age, every, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel the task and wait up to `wait` for it. Returns `true` when it
    /// exited cleanly.
    pub async fn stop(self, wait: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(wait, self.task).await {
            Ok(Ok(())) => {
                tracing::debug!("History pruning stopped");
                true
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "History pruning task failed");
                false
            }
            Err(_) => {
                tracing::warn!(wait_ms = wait.as_millis() as u64, "History pruning did not stop in time");
                false
            }
        }
    }
}

async fn prune_loop(
    queue: Arc<JobQueue>,
    max_age: TimeDelta,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                queue.prune_history(max_age).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
