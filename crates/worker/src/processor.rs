//! Single-worker job processor.
//!
//! One loop takes jobs from the [`JobQueue`] and drives each through
//! upload, workflow build, submission, progress tracking, download and
//! delivery. Everything up to the stored result is bounded by a timeout;
//! delivery runs after it. Every job ends in exactly one `complete` call; failures also produce exactly one failure
//! notification. The loop itself only stops on shutdown or when the queue
//! reports a broken invariant.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use editbot_comfyui::api::ComfyUIApiError;
use editbot_comfyui::client::ComfyUIClient;
use editbot_comfyui::history::{select_image, ImageRef};
use editbot_comfyui::tracker::{CallbackError, ProgressListener, TrackError, TrackOutcome};
use editbot_comfyui::workflow::{BuiltWorkflow, WorkflowBuilder, WorkflowError};
use editbot_core::job::{DeliveryTarget, Job, JobOutcome};
use editbot_core::progress::{render_progress, ProgressSnapshot};

use crate::queue::{JobQueue, QueueError};
use crate::sink::{DeliverySink, ResultMetadata, SinkError};

const STARTED_TEXT: &str = "🔄 Processing started...";

fn failure_text(error: &str) -> String {
    format!("❌ Processing failed:\n{error}\n\nPlease try again.")
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// The generation backend as seen by the processor.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Upload the input image and return the backend's name for it.
    async fn upload(&self, path: &Path) -> Result<String, ComfyUIApiError>;

    /// Queue a built workflow and return its prompt id.
    async fn submit(&self, workflow: &BuiltWorkflow) -> Result<String, ComfyUIApiError>;

    async fn track(
        &self,
        prompt_id: &str,
        listener: &dyn ProgressListener,
        timeout: Duration,
    ) -> Result<TrackOutcome, TrackError>;

    async fn download(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError>;
}

#[async_trait]
impl GenerationBackend for ComfyUIClient {
    async fn upload(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        self.submit_asset(path).await
    }

    async fn submit(&self, workflow: &BuiltWorkflow) -> Result<String, ComfyUIApiError> {
        self.submit_job(workflow).await
    }

    async fn track(
        &self,
        prompt_id: &str,
        listener: &dyn ProgressListener,
        timeout: Duration,
    ) -> Result<TrackOutcome, TrackError> {
        self.track_progress(prompt_id, listener, timeout).await
    }

    async fn download(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        self.fetch_asset(image).await
    }
}

// ---------------------------------------------------------------------------
// Errors and config
// ---------------------------------------------------------------------------

/// Why a single job failed. The display text is what the user sees.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to upload image: {0}")]
    Upload(#[source] ComfyUIApiError),

    #[error("Failed to build workflow: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Failed to submit workflow: {0}")]
    Submission(#[source] ComfyUIApiError),

    #[error(transparent)]
    Tracking(#[from] TrackError),

    #[error("No output image produced")]
    NoOutput,

    #[error("Failed to download result: {0}")]
    Download(#[source] ComfyUIApiError),

    #[error("Failed to save result: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Failed to deliver result: {0}")]
    Delivery(#[source] SinkError),

    #[error("Processing timeout ({}s)", .0.as_secs_f64())]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Wall-clock budget for one job, from upload to the stored result.
    /// Delivery is not counted.
    pub job_timeout: Duration,
    /// Directory that downloaded results are written to.
    pub output_dir: PathBuf,
    /// Node whose images are preferred as the result.
    pub output_node: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            output_dir: PathBuf::from("data/output"),
            output_node: "102".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct Processor {
    queue: Arc<JobQueue>,
    backend: Arc<dyn GenerationBackend>,
    workflows: Arc<WorkflowBuilder>,
    sink: Arc<dyn DeliverySink>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        queue: Arc<JobQueue>,
        backend: Arc<dyn GenerationBackend>,
        workflows: Arc<WorkflowBuilder>,
        sink: Arc<dyn DeliverySink>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            backend,
            workflows,
            sink,
            config,
        }
    }

    /// Process jobs until `cancel` fires.
    ///
    /// Cancellation is only observed between jobs; a job already taken from
    /// the queue always runs to completion or timeout. Returns an error only
    /// when the queue rejects a completion.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        tracing::info!(
            timeout_secs = self.config.job_timeout.as_secs(),
            "Processor started",
        );

        loop {
            let job = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                job = self.queue.dequeue() => job,
            };
            self.process(job).await?;
        }

        tracing::info!("Processor stopped");
        Ok(())
    }

    /// Run one dequeued job and report its outcome to the queue.
    pub async fn process(&self, job: Job) -> Result<(), QueueError> {
        let started = Instant::now();
        let target = job.target;
        tracing::info!(job_id = %job.id, short_id = %job.short_id(), user_id = job.user_id(), "Processing job");

        let generation = self.execute(&job, started);
        let result = match tokio::time::timeout(self.config.job_timeout, generation).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout(self.config.job_timeout)),
        };
        let result = match result {
            Ok(generated) => self.deliver(&job, generated).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(result_path) => {
                tracing::info!(
                    job_id = %job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed",
                );
                self.queue
                    .complete(job, JobOutcome::Success { result_path })
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(job_id = %job.id, error = %message, "Job failed");
                self.queue.complete(job, JobOutcome::failure(&message)).await?;
                self.notify(&target, &failure_text(&message)).await;
                Ok(())
            }
        }
    }

    /// Generate and store the result. Runs under the job timeout.
    async fn execute(&self, job: &Job, started: Instant) -> Result<Generated, ProcessError> {
        self.notify(&job.target, STARTED_TEXT).await;

        let input_name = self
            .backend
            .upload(&job.image_path)
            .await
            .map_err(ProcessError::Upload)?;

        let built = self.workflows.build(&job.params, &input_name)?;

        let prompt_id = self
            .backend
            .submit(&built)
            .await
            .map_err(ProcessError::Submission)?;
        tracing::info!(job_id = %job.id, prompt_id = %prompt_id, seed = built.seed, "Prompt queued");

        let relay = ProgressRelay {
            sink: Arc::clone(&self.sink),
            target: job.target,
        };
        let remaining = self.config.job_timeout.saturating_sub(started.elapsed());
        let outcome = self.backend.track(&prompt_id, &relay, remaining).await?;

        let image =
            select_image(&outcome.outputs, &self.config.output_node).ok_or(ProcessError::NoOutput)?;
        let bytes = self
            .backend
            .download(&image)
            .await
            .map_err(ProcessError::Download)?;

        let result_path = self.store_result(job, &image, &bytes).await?;

        let metadata = ResultMetadata {
            prompt: job.params.positive_prompt.clone(),
            steps: job.params.steps,
            seed: built.seed,
            cfg: job.params.cfg,
        };
        Ok(Generated {
            result_path,
            metadata,
        })
    }

    async fn deliver(&self, job: &Job, generated: Generated) -> Result<PathBuf, ProcessError> {
        self.sink
            .deliver_result(&job.target, &generated.result_path, &generated.metadata)
            .await
            .map_err(ProcessError::Delivery)?;
        Ok(generated.result_path)
    }

    /// Write the result to `<output_dir>/<job id>_<file name>`.
    async fn store_result(
        &self,
        job: &Job,
        image: &ImageRef,
        bytes: &[u8],
    ) -> Result<PathBuf, ProcessError> {
        // Only the final component of the backend's file name is trusted.
        let file_name = Path::new(&image.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result.png".to_string());

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let path = self.config.output_dir.join(format!("{}_{file_name}", job.id));
        tokio::fs::write(&path, bytes).await?;

        tracing::debug!(job_id = %job.id, path = %path.display(), size = bytes.len(), "Result saved");
        Ok(path)
    }

    /// Best-effort notification; failures are logged.
    async fn notify(&self, target: &DeliveryTarget, text: &str) {
        if let Err(e) = self.sink.notify(target, text).await {
            tracing::warn!(chat_id = target.chat_id, error = %e, "Notification failed");
        }
    }

    /// Run [`run`](Self::run) on a background task.
    ///
    /// If the loop stops because of a queue error, `cancel` is triggered so
    /// the rest of the application shuts down too.
    pub fn spawn(self, cancel: CancellationToken) -> ProcessorHandle {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = self.run(token.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Processor stopped on queue error");
                token.cancel();
            }
            result
        });
        ProcessorHandle { cancel, task }
    }
}

/// A stored result waiting for delivery.
struct Generated {
    result_path: PathBuf,
    metadata: ResultMetadata,
}

/// Relays step progress to the job's status message.
struct ProgressRelay {
    sink: Arc<dyn DeliverySink>,
    target: DeliveryTarget,
}

#[async_trait]
impl ProgressListener for ProgressRelay {
    async fn on_progress(&self, snapshot: ProgressSnapshot) -> Result<(), CallbackError> {
        let text = render_progress(snapshot.current, snapshot.total);
        self.sink.notify(&self.target, &text).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub struct ProcessorHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), QueueError>>,
}

impl ProcessorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop and wait up to `grace` for the current job.
    /// The task is aborted if it is still running after that.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), QueueError> {
        self.cancel.cancel();

        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "Processor task panicked");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "Processor did not stop in time, aborting");
                self.task.abort();
                Ok(())
            }
        }
    }
}
