//! Delivery sinks: where progress notifications and results go.
//!
//! The chat transport is external; the worker only needs [`DeliverySink`].
//! [`LogSink`] writes everything to `tracing`, [`WebhookSink`] forwards to
//! an HTTP endpoint owned by the chat side.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use editbot_core::job::DeliveryTarget;

/// Retry delays for result delivery (exponential backoff: 1s, 2s, 4s).
const RESULT_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// HTTP request timeout for a single webhook call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote endpoint returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),

    /// The result file could not be read.
    #[error("Failed to read result file: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Result metadata
// ---------------------------------------------------------------------------

/// What the user sees alongside the result image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    pub prompt: String,
    pub steps: u32,
    /// The seed actually used, after random-seed resolution.
    pub seed: u64,
    pub cfg: f64,
}

impl ResultMetadata {
    pub fn caption(&self) -> String {
        format!(
            "✅ Done!\n\n🎨 Prompt: {}\n🔢 Steps: {}\n🎲 Seed: {}\n⚙️ CFG: {}",
            self.prompt, self.steps, self.seed, self.cfg
        )
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Show `text` to the user, replacing the job's status message.
    async fn notify(&self, target: &DeliveryTarget, text: &str) -> Result<(), SinkError>;

    /// Send the finished image with its caption.
    async fn deliver_result(
        &self,
        target: &DeliveryTarget,
        asset: &Path,
        metadata: &ResultMetadata,
    ) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Sink that only logs. Used when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn notify(&self, target: &DeliveryTarget, text: &str) -> Result<(), SinkError> {
        tracing::info!(
            chat_id = target.chat_id,
            message_id = target.message_id,
            text,
            "Notification",
        );
        Ok(())
    }

    async fn deliver_result(
        &self,
        target: &DeliveryTarget,
        asset: &Path,
        metadata: &ResultMetadata,
    ) -> Result<(), SinkError> {
        tracing::info!(
            chat_id = target.chat_id,
            path = %asset.display(),
            seed = metadata.seed,
            "Result ready",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookSink
// ---------------------------------------------------------------------------

/// Forwards notifications (JSON) and results (multipart) to `url`.
///
/// Notifications are sent once; progress updates are frequent and a lost
/// one is replaced by the next. Result delivery is retried with backoff.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

#[derive(Serialize)]
struct NotifyPayload<'a> {
    kind: &'static str,
    #[serde(flatten)]
    target: &'a DeliveryTarget,
    text: &'a str,
}

impl WebhookSink {
    pub fn new(url: String) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url,
            retry_delays: RESULT_RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        })
    }

    /// Override the backoff schedule for result delivery.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    async fn try_send_result(
        &self,
        target: &DeliveryTarget,
        file_name: &str,
        bytes: &[u8],
        metadata: &ResultMetadata,
    ) -> Result<(), SinkError> {
        let meta = serde_json::json!({
            "kind": "result",
            "user_id": target.user_id,
            "chat_id": target.chat_id,
            "message_id": target.message_id,
            "caption": metadata.caption(),
            "metadata": metadata,
        });

        let form = reqwest::multipart::Form::new()
            .text("metadata", meta.to_string())
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
            );

        let response = self.client.post(&self.url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn notify(&self, target: &DeliveryTarget, text: &str) -> Result<(), SinkError> {
        let payload = NotifyPayload {
            kind: "notify",
            target,
            text,
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    async fn deliver_result(
        &self,
        target: &DeliveryTarget,
        asset: &Path,
        metadata: &ResultMetadata,
    ) -> Result<(), SinkError> {
        let bytes = tokio::fs::read(asset).await?;
        let file_name = asset
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result.png".to_string());

        let mut delays = self.retry_delays.iter();
        let mut attempt = 1;
        loop {
            let err = match self.try_send_result(target, &file_name, &bytes, metadata).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let Some(delay) = delays.next() else {
                tracing::error!(attempt, url = %self.url, error = %err, "Result delivery failed after all retries");
                return Err(err);
            };
            tracing::warn!(
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Result delivery attempt failed, retrying"
            );
            tokio::time::sleep(*delay).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{FromRequest, Multipart, Request, State};
    use axum::http::{header, StatusCode};
    use axum::routing::post;
    use axum::Router;

    use super::*;

    #[derive(Debug, Default)]
    struct Captured {
        json: Vec<serde_json::Value>,
        /// `(metadata, image file name)` per delivered result.
        results: Vec<(serde_json::Value, String)>,
    }

    #[derive(Clone, Default)]
    struct Hook {
        captured: Arc<Mutex<Captured>>,
        failures_left: Arc<AtomicU32>,
    }

    /// Fake chat-side endpoint: fails `failures_left` times, then records
    /// JSON notifications and multipart results.
    async fn hook(State(hook): State<Hook>, request: Request) -> StatusCode {
        if hook.failures_left.load(Ordering::SeqCst) > 0 {
            hook.failures_left.fetch_sub(1, Ordering::SeqCst);
            return StatusCode::BAD_GATEWAY;
        }

        let is_multipart = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("multipart/form-data"));

        if is_multipart {
            let Ok(mut multipart) = Multipart::from_request(request, &()).await else {
                return StatusCode::BAD_REQUEST;
            };
            let mut meta = serde_json::Value::Null;
            let mut file_name = String::new();
            while let Ok(Some(field)) = multipart.next_field().await {
                let name = field.name().map(str::to_owned);
                match name.as_deref() {
                    Some("metadata") => {
                        let text = field.text().await.unwrap_or_default();
                        meta = serde_json::from_str(&text).unwrap_or_default();
                    }
                    Some("image") => {
                        file_name = field.file_name().unwrap_or_default().to_string();
                    }
                    _ => {}
                }
            }
            hook.captured.lock().unwrap().results.push((meta, file_name));
        } else {
            let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .unwrap_or_default();
            let json = serde_json::from_slice(&body).unwrap_or_default();
            hook.captured.lock().unwrap().json.push(json);
        }
        StatusCode::OK
    }

    async fn spawn_hook(failures: u32) -> (String, Hook) {
        let state = Hook::default();
        state.failures_left.store(failures, Ordering::SeqCst);
        let app = Router::new().route("/hook", post(hook)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), state)
    }

    fn target() -> DeliveryTarget {
        DeliveryTarget {
            user_id: 5,
            chat_id: 50,
            message_id: 500,
        }
    }

    fn metadata() -> ResultMetadata {
        ResultMetadata {
            prompt: "add snow".into(),
            steps: 8,
            seed: 1234,
            cfg: 1.0,
        }
    }

    #[test]
    fn caption_lists_prompt_steps_seed_cfg() {
        let caption = metadata().caption();
        assert!(caption.starts_with("✅ Done!"));
        assert!(caption.contains("Prompt: add snow"));
        assert!(caption.contains("Steps: 8"));
        assert!(caption.contains("Seed: 1234"));
        assert!(caption.contains("CFG: 1"));
    }

    #[test]
    fn sink_error_display() {
        assert_eq!(SinkError::HttpStatus(502).to_string(), "Webhook returned HTTP 502");
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        let sink = LogSink;
        sink.notify(&target(), "hello").await.unwrap();
        sink.deliver_result(&target(), Path::new("/tmp/none.png"), &metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_notify_posts_json() {
        let (url, hook) = spawn_hook(0).await;
        let sink = WebhookSink::new(url).unwrap();

        sink.notify(&target(), "🔄 Processing started...").await.unwrap();

        let captured = hook.captured.lock().unwrap();
        let body = &captured.json[0];
        assert_eq!(body["kind"], "notify");
        assert_eq!(body["chat_id"], 50);
        assert_eq!(body["message_id"], 500);
        assert_eq!(body["text"], "🔄 Processing started...");
    }

    #[tokio::test]
    async fn webhook_notify_surfaces_http_status() {
        let (url, _hook) = spawn_hook(1).await;
        let sink = WebhookSink::new(url).unwrap();
        let err = sink.notify(&target(), "x").await.unwrap_err();
        assert!(matches!(err, SinkError::HttpStatus(502)));
    }

    #[tokio::test]
    async fn webhook_result_is_retried_then_delivered() {
        let (url, hook) = spawn_hook(2).await;
        let sink = WebhookSink::new(url)
            .unwrap()
            .with_retry_delays(vec![Duration::from_millis(5); 3]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_result.png");
        std::fs::write(&path, b"png-bytes").unwrap();

        sink.deliver_result(&target(), &path, &metadata()).await.unwrap();

        let captured = hook.captured.lock().unwrap();
        assert_eq!(captured.results.len(), 1);
        let (meta, file_name) = &captured.results[0];
        assert_eq!(file_name, "job_result.png");
        assert_eq!(meta["kind"], "result");
        assert_eq!(meta["metadata"]["seed"], 1234);
    }

    #[tokio::test]
    async fn webhook_result_with_missing_file_is_io_error() {
        let sink = WebhookSink::new("http://127.0.0.1:9/hook".into()).unwrap();
        let err = sink
            .deliver_result(&target(), Path::new("/nonexistent/r.png"), &metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }
}
