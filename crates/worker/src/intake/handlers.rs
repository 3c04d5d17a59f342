//! Job admission, queue status and per-user job handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use editbot_core::error::CoreError;
use editbot_core::job::{DeliveryTarget, Job, JobStatus};
use editbot_core::params::{EditParams, ParamDefaults};
use editbot_core::types::{ChatRef, JobId, Timestamp};

use super::error::{IntakeError, IntakeResult};
use super::{DataResponse, IntakeState};
use crate::queue::CancelOutcome;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Request body for POST /api/v1/jobs.
///
/// Unset parameters take the configured defaults.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    pub user_id: ChatRef,
    pub chat_id: ChatRef,
    pub message_id: ChatRef,
    #[validate(length(min = 1, message = "image_path must not be empty"))]
    pub image_path: String,
    #[validate(length(min = 1, max = 2000, message = "prompt must be 1-2000 characters"))]
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub seed: Option<u64>,
    pub strength: Option<f64>,
    pub eta: Option<f64>,
    pub denoise: Option<f64>,
}

impl CreateJobRequest {
    fn to_params(&self, defaults: &ParamDefaults) -> EditParams {
        let mut params = EditParams::with_defaults(self.prompt.trim(), defaults);
        if let Some(negative) = &self.negative_prompt {
            params.negative_prompt = negative.clone();
        }
        if let Some(steps) = self.steps {
            params.steps = steps;
        }
        if let Some(cfg) = self.cfg {
            params.cfg = cfg;
        }
        if let Some(sampler) = &self.sampler {
            params.sampler = sampler.clone();
        }
        if let Some(scheduler) = &self.scheduler {
            params.scheduler = scheduler.clone();
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if let Some(strength) = self.strength {
            params.strength = strength;
        }
        if let Some(eta) = self.eta {
            params.eta = eta;
        }
        if let Some(denoise) = self.denoise {
            params.denoise = denoise;
        }
        params
    }

    fn target(&self) -> DeliveryTarget {
        DeliveryTarget {
            user_id: self.user_id,
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    /// 1-based position in the pending queue.
    pub position: usize,
}

/// Public view of a queued or running job.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub prompt: String,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            prompt: job.params.positive_prompt.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Validates the request, merges defaults, checks limits and enqueues.
/// Nothing reaches the queue unless every check passes.
pub async fn create_job(
    State(state): State<IntakeState>,
    Json(input): Json<CreateJobRequest>,
) -> IntakeResult<impl IntoResponse> {
    input
        .validate()
        .map_err(|e| IntakeError::BadRequest(e.to_string()))?;
    if input.prompt.trim().is_empty() {
        return Err(CoreError::Validation("Prompt must not be blank".into()).into());
    }

    let params = input.to_params(&state.defaults);
    params.validate(&state.limits)?;

    if !tokio::fs::try_exists(&input.image_path).await.unwrap_or(false) {
        return Err(CoreError::Validation(format!(
            "Input image not found: {}",
            input.image_path
        ))
        .into());
    }

    let job = Job::new(input.target(), &input.image_path, params);
    let job_id = job.id;
    let position = state.queue.enqueue(job).await?;

    tracing::info!(job_id = %job_id, user_id = input.user_id, position, "Job admitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: CreateJobResponse { job_id, position },
        }),
    ))
}

/// GET /api/v1/queue
pub async fn queue_status(State(state): State<IntakeState>) -> impl IntoResponse {
    let status = state.queue.status().await;
    Json(DataResponse { data: status })
}

/// GET /api/v1/users/{user_id}/job
///
/// The user's pending or running job.
pub async fn get_user_job(
    State(state): State<IntakeState>,
    Path(user_id): Path<ChatRef>,
) -> IntakeResult<impl IntoResponse> {
    let job = state
        .queue
        .find_by_user(user_id)
        .await
        .ok_or_else(|| IntakeError::NotFound(format!("No active job for user {user_id}")))?;

    Ok(Json(DataResponse {
        data: JobView::from(&job),
    }))
}

/// DELETE /api/v1/users/{user_id}/job
///
/// Removes the user's pending job. A job that is already running cannot be
/// cancelled.
pub async fn cancel_user_job(
    State(state): State<IntakeState>,
    Path(user_id): Path<ChatRef>,
) -> IntakeResult<impl IntoResponse> {
    match state.queue.cancel_for_user(user_id).await {
        CancelOutcome::Cancelled(job) => {
            tracing::info!(job_id = %job.id, user_id, "Job cancelled by user");
            Ok(Json(DataResponse {
                data: JobView::from(&job),
            }))
        }
        CancelOutcome::Processing(job_id) => Err(IntakeError::Conflict(format!(
            "Job {job_id} is already processing"
        ))),
        CancelOutcome::NotFound => Err(IntakeError::NotFound(format!(
            "No pending job for user {user_id}"
        ))),
    }
}
