//! Progress tracking for one submitted prompt.
//!
//! The event stream is the primary signal: `progress` events are relayed to
//! a [`ProgressListener`], `executed` events accumulate node outputs, and
//! `executing` with `node: null` (or `execution_success`) marks completion.
//! The stream is unreliable, so the tracker also:
//!
//! - checks the history record whenever a read times out and at least
//!   `fallback_interval` has passed since the previous check,
//! - checks history once more after the stream ends without outputs,
//! - checks history once when the stream fails before giving up.
//!
//! The whole operation is bounded by a wall-clock timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use editbot_core::progress::ProgressSnapshot;

use crate::client::ComfyUIClient;
use crate::history::{HistoryRecord, NodeOutputs};
use crate::messages::{StepUpdate, StreamEvent};

/// Error type returned by progress listeners.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Receives step progress while a prompt runs.
///
/// Failures are logged and otherwise ignored; they never abort tracking.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    async fn on_progress(&self, snapshot: ProgressSnapshot) -> Result<(), CallbackError>;
}

/// Listener that discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressListener for NoProgress {
    async fn on_progress(&self, _snapshot: ProgressSnapshot) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Timing parameters for [`track_progress`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Longest wait for a single stream frame before considering a
    /// history check.
    pub read_timeout: Duration,
    /// Minimum spacing between periodic history checks.
    pub fallback_interval: Duration,
    /// Timeout of one history request.
    pub history_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            fallback_interval: Duration::from_secs(10),
            history_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Finished with at least one node output.
    Completed,
    /// Finished, but neither the stream nor history listed any output.
    CompletedNoOutput,
}

/// Where the final outputs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Stream,
    History,
}

/// Result of a successfully tracked prompt.
#[derive(Debug, Clone)]
pub struct TrackOutcome {
    pub prompt_id: String,
    pub outputs: NodeOutputs,
    pub status: TrackStatus,
    pub source: CompletionSource,
}

impl TrackOutcome {
    fn new(prompt_id: &str, outputs: NodeOutputs, source: CompletionSource) -> Self {
        let status = if outputs.is_empty() {
            TrackStatus::CompletedNoOutput
        } else {
            TrackStatus::Completed
        };
        Self {
            prompt_id: prompt_id.to_string(),
            outputs,
            status,
            source,
        }
    }
}

/// Why tracking did not produce an outcome.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Execution timeout after {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// The backend reported an error for our prompt.
    #[error("ComfyUI execution error on node {node_id}: {message}")]
    Execution { node_id: String, message: String },

    /// The stream failed and history did not show completion.
    #[error("Progress stream failed: {0}")]
    Protocol(String),
}

/// Follow `prompt_id` until completion, failure, or `timeout`.
pub async fn track_progress(
    client: &ComfyUIClient,
    prompt_id: &str,
    listener: &dyn ProgressListener,
    timeout: Duration,
) -> Result<TrackOutcome, TrackError> {
    tracing::info!(prompt_id, timeout_secs = timeout.as_secs(), "Tracking progress");

    let mut tracking = Tracking {
        client,
        prompt_id,
        listener,
        outputs: NodeOutputs::new(),
        last_step: None,
    };

    match tokio::time::timeout(timeout, tracking.run()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(prompt_id, timeout_secs = timeout.as_secs(), "Progress tracking timed out");
            Err(TrackError::Timeout(timeout))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

struct Tracking<'a> {
    client: &'a ComfyUIClient,
    prompt_id: &'a str,
    listener: &'a dyn ProgressListener,
    outputs: NodeOutputs,
    /// Last step value forwarded to the listener.
    last_step: Option<u32>,
}

impl Tracking<'_> {
    async fn run(&mut self) -> Result<TrackOutcome, TrackError> {
        let mut ws = match self.client.connect_events().await {
            Ok(ws) => ws,
            Err(e) => return self.after_stream_failure(e.to_string()).await,
        };

        let config = self.client.tracker_config().clone();
        let mut last_check = Instant::now();

        loop {
            let frame = match tokio::time::timeout(config.read_timeout, ws.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    if last_check.elapsed() >= config.fallback_interval {
                        last_check = Instant::now();
                        tracing::debug!(prompt_id = self.prompt_id, "Stream idle, checking history");
                        if let Some(record) = self.lookup_history().await {
                            if record.completed {
                                tracing::info!(prompt_id = self.prompt_id, "Completion found via history");
                                return Ok(self.from_history(record));
                            }
                        }
                    }
                    continue;
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if self.handle_text(&text).await? == Flow::Done {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    // Preview frames; not used.
                    tracing::trace!(size = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    return self
                        .after_stream_failure(format!("stream closed by server: {frame:?}"))
                        .await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return self.after_stream_failure(e.to_string()).await,
                None => return self.after_stream_failure("stream ended".to_string()).await,
            }
        }

        if let Err(e) = ws.close(None).await {
            tracing::debug!(error = %e, "Failed to close event stream cleanly");
        }

        Ok(self.finish_from_stream().await)
    }

    async fn handle_text(&mut self, text: &str) -> Result<Flow, TrackError> {
        let event = match StreamEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unrecognised ComfyUI message");
                return Ok(Flow::Continue);
            }
        };

        match event {
            StreamEvent::Status(_) => {
                tracing::debug!(queue_remaining = ?event.queue_remaining(), "Queue status");
                return Ok(Flow::Continue);
            }
            StreamEvent::Progress(update) => {
                self.relay_progress(update).await;
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        // An execution error without a prompt id is taken to be ours.
        if event.prompt_id().is_some_and(|id| id != self.prompt_id) {
            tracing::trace!(event = ?event, "Event for another prompt");
            return Ok(Flow::Continue);
        }

        match event {
            StreamEvent::ExecutionStart { .. } => {
                tracing::info!(prompt_id = self.prompt_id, "Execution started");
            }
            StreamEvent::ExecutionCached { nodes, .. } => {
                tracing::debug!(nodes = ?nodes, "Cached nodes skipped");
            }
            StreamEvent::Executing { node: None, .. } => {
                tracing::info!(prompt_id = self.prompt_id, "Execution finished");
                return Ok(Flow::Done);
            }
            StreamEvent::Executing { node: Some(node), .. } => {
                tracing::debug!(node = %node, "Executing node");
            }
            StreamEvent::Executed { node, output, .. } => {
                if has_content(&output) {
                    tracing::debug!(node = %node, "Node output received");
                    self.outputs.insert(node, output);
                }
            }
            StreamEvent::ExecutionError(failure) => {
                tracing::error!(
                    prompt_id = self.prompt_id,
                    node_id = %failure.node_id,
                    node_type = %failure.node_type,
                    exception_type = %failure.exception_type,
                    message = %failure.exception_message,
                    "ComfyUI execution error",
                );
                return Err(TrackError::Execution {
                    node_id: failure.node_id,
                    message: failure.exception_message,
                });
            }
            StreamEvent::ExecutionSuccess { .. } => {
                tracing::info!(prompt_id = self.prompt_id, "Execution succeeded");
                return Ok(Flow::Done);
            }
            StreamEvent::ExecutionInterrupted { .. } => {
                tracing::warn!(prompt_id = self.prompt_id, "Execution interrupted");
                return Err(TrackError::Execution {
                    node_id: String::new(),
                    message: "Execution interrupted".to_string(),
                });
            }
            StreamEvent::Status(_) | StreamEvent::Progress(_) => {}
        }

        Ok(Flow::Continue)
    }

    /// Forward a step update, keeping forwarded values non-decreasing.
    async fn relay_progress(&mut self, data: StepUpdate) {
        if data.prompt_id.as_deref().is_some_and(|p| p != self.prompt_id) {
            return;
        }
        if self.last_step.is_some_and(|last| data.value < last) {
            tracing::trace!(value = data.value, "Dropping out-of-order progress");
            return;
        }
        self.last_step = Some(data.value);

        let snapshot = ProgressSnapshot::new(data.value, data.max);
        tracing::info!(
            prompt_id = self.prompt_id,
            step = data.value,
            total = data.max,
            percent = snapshot.percent(),
            "Progress",
        );

        if let Err(e) = self.listener.on_progress(snapshot).await {
            tracing::warn!(error = %e, "Progress listener failed");
        }
    }

    async fn lookup_history(&self) -> Option<HistoryRecord> {
        match self.client.fetch_job_record(self.prompt_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(prompt_id = self.prompt_id, error = %e, "History check failed");
                None
            }
        }
    }

    fn from_history(&self, record: HistoryRecord) -> TrackOutcome {
        TrackOutcome::new(self.prompt_id, record.outputs, CompletionSource::History)
    }

    /// The stream reported completion. Fall back to history once if no
    /// outputs were seen on the stream.
    async fn finish_from_stream(&mut self) -> TrackOutcome {
        if !self.outputs.is_empty() {
            let outputs = std::mem::take(&mut self.outputs);
            return TrackOutcome::new(self.prompt_id, outputs, CompletionSource::Stream);
        }

        tracing::warn!(prompt_id = self.prompt_id, "No outputs on stream, checking history");
        match self.lookup_history().await {
            Some(record) if !record.outputs.is_empty() => self.from_history(record),
            _ => {
                tracing::error!(prompt_id = self.prompt_id, "No outputs found in history either");
                TrackOutcome::new(self.prompt_id, NodeOutputs::new(), CompletionSource::Stream)
            }
        }
    }

    async fn after_stream_failure(&self, reason: String) -> Result<TrackOutcome, TrackError> {
        tracing::warn!(prompt_id = self.prompt_id, reason = %reason, "Event stream failed, checking history");
        match self.lookup_history().await {
            Some(record) if record.completed => Ok(self.from_history(record)),
            _ => Err(TrackError::Protocol(reason)),
        }
    }
}

/// `executed` payloads that are `null` or `{}` carry nothing to keep.
fn has_content(output: &serde_json::Value) -> bool {
    match output {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
