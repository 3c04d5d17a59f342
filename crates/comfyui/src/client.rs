//! Protocol client for a single ComfyUI instance.
//!
//! [`ComfyUIClient`] bundles the pooled HTTP API wrapper with the event
//! stream endpoint and a client-session id that stays fixed for the
//! lifetime of the client. Every submission and every event-stream
//! connection uses that same id, so the backend routes progress events for
//! our prompts to our stream.

use std::path::Path;
use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{HistoryRecord, ImageRef};
use crate::readiness::{wait_ready, ReadinessConfig};
use crate::tracker::{self, ProgressListener, TrackError, TrackOutcome, TrackerConfig};
use crate::workflow::BuiltWorkflow;

/// A live WebSocket connection to the ComfyUI event stream.
pub type EventStream =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection handle for one ComfyUI instance.
pub struct ComfyUIClient {
    api: ComfyUIApi,
    ws_url: String,
    client_id: String,
    tracker: TrackerConfig,
}

impl ComfyUIClient {
    /// Create a new client targeting a specific ComfyUI instance.
    ///
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    ///
    /// A fresh client-session id (UUID v4) is generated here and reused for
    /// every request this client makes.
    pub fn new(api_url: String, ws_url: String) -> Self {
        let client_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(client_id = %client_id, api_url = %api_url, "ComfyUI client created");
        Self {
            api: ComfyUIApi::new(api_url),
            ws_url,
            client_id,
            tracker: TrackerConfig::default(),
        }
    }

    /// Client for `host:port` over plain HTTP and WebSocket.
    pub fn from_host(host: &str, port: u16) -> Self {
        Self::new(format!("http://{host}:{port}"), format!("ws://{host}:{port}"))
    }

    /// Replace the progress-tracking timing parameters.
    pub fn with_tracker_config(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn tracker_config(&self) -> &TrackerConfig {
        &self.tracker
    }

    /// Open the event stream for this client's session id.
    pub async fn connect_events(&self) -> Result<EventStream, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(client_id = %self.client_id, "Connected to ComfyUI event stream");
        Ok(ws_stream)
    }

    /// Single short-timeout health probe. Never fails.
    pub async fn probe_health(&self, timeout: Duration) -> bool {
        self.api.probe_health(timeout).await
    }

    /// Probe at a fixed interval until the backend answers or the attempts
    /// run out.
    pub async fn wait_ready(&self, config: &ReadinessConfig, cancel: &CancellationToken) -> bool {
        wait_ready(&self.api, config, cancel).await
    }

    /// Upload an input image and return the backend's name for it.
    pub async fn submit_asset(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        Ok(self.api.upload_image(path).await?.name)
    }

    /// Queue a built workflow under this client's session id and return the
    /// backend-assigned prompt id.
    pub async fn submit_job(&self, workflow: &BuiltWorkflow) -> Result<String, ComfyUIApiError> {
        let response = self
            .api
            .submit_workflow(
                &workflow.document,
                &self.client_id,
                workflow.extra_pnginfo.as_ref(),
            )
            .await?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response.prompt_id)
    }

    /// Follow a submitted prompt to completion. See [`tracker`] for the
    /// stream/fallback state machine.
    pub async fn track_progress(
        &self,
        prompt_id: &str,
        listener: &dyn ProgressListener,
        timeout: Duration,
    ) -> Result<TrackOutcome, TrackError> {
        tracker::track_progress(self, prompt_id, listener, timeout).await
    }

    /// Download a result file.
    pub async fn fetch_asset(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        self.api.fetch_image(image).await
    }

    /// Read the backend's completion record directly, bypassing the stream.
    pub async fn fetch_job_record(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryRecord>, ComfyUIApiError> {
        self.api
            .fetch_job_record(prompt_id, self.tracker.history_timeout)
            .await
    }
}

/// Errors that can occur when opening the event stream.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
