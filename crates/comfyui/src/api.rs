//! Thin wrapper over the ComfyUI HTTP endpoints the worker touches:
//! `/system_stats`, `/upload/image`, `/prompt`, `/history/{id}` and `/view`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::history::{parse_history_record, HistoryRecord, ImageRef};

/// Timeout for the `/upload/image` and `/view` transfers.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for small JSON requests (`/prompt`, `/history`).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

/// Body of a `/prompt` reply.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Backend queue number, absent on some builds.
    #[serde(default)]
    pub number: i32,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    /// Name under which the backend stored the file. Pass this to the
    /// workflow's image loader node.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx reply; `body` is kept verbatim for the logs.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// The local input file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed ComfyUI response: missing {0}")]
    MissingField(&'static str),
}

impl ComfyUIApi {
    /// `base_url` is scheme, host and port, e.g. `http://127.0.0.1:8188`.
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn system_stats(
        &self,
        timeout: Duration,
    ) -> Result<serde_json::Value, ComfyUIApiError> {
        let request = self.http.get(self.endpoint("system_stats")).timeout(timeout);
        read_json(request.send().await?).await
    }

    /// `true` when `/system_stats` answers 2xx within `timeout`.
    pub async fn probe_health(&self, timeout: Duration) -> bool {
        match self.system_stats(timeout).await {
            Ok(stats) => {
                tracing::debug!(?stats, "ComfyUI health check OK");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ComfyUI health check failed");
                false
            }
        }
    }

    /// Copy a local file into the backend's input folder. Each call may
    /// create a new remote file.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadedImage, ComfyUIApiError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input.png".to_string());

        tracing::info!(filename = %filename, size = bytes.len(), "Uploading image");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str(guess_mime(path))?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let request = self
            .http
            .post(self.endpoint("upload/image"))
            .multipart(form)
            .timeout(TRANSFER_TIMEOUT);

        let uploaded: UploadedImage = read_json(request.send().await?).await?;
        tracing::info!(name = %uploaded.name, "Image uploaded");
        Ok(uploaded)
    }

    /// Queue an API-format workflow. `extra_pnginfo` (the UI workflow) is
    /// passed through for saver nodes that embed it in the image.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
        extra_pnginfo: Option<&serde_json::Value>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let mut body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        if let Some(info) = extra_pnginfo {
            body["extra_data"] = serde_json::json!({ "extra_pnginfo": info });
        }

        let request = self
            .http
            .post(self.endpoint("prompt"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT);

        let submitted: SubmitResponse = read_json(request.send().await?).await?;
        if submitted.prompt_id.is_empty() {
            return Err(ComfyUIApiError::MissingField("prompt_id"));
        }
        Ok(submitted)
    }

    /// Raw `/history/{prompt_id}` body: `{}` until the prompt has run,
    /// then an object keyed by the prompt id.
    pub async fn get_history(
        &self,
        prompt_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, ComfyUIApiError> {
        let request = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}")))
            .timeout(timeout);
        read_json(request.send().await?).await
    }

    /// History record for `prompt_id`, or `None` if the backend has none yet.
    pub async fn fetch_job_record(
        &self,
        prompt_id: &str,
        timeout: Duration,
    ) -> Result<Option<HistoryRecord>, ComfyUIApiError> {
        let body = self.get_history(prompt_id, timeout).await?;
        Ok(parse_history_record(&body, prompt_id))
    }

    /// Fetch the bytes of a generated file.
    pub async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        tracing::info!(filename = %image.filename, "Downloading image");

        let mut query = vec![
            ("filename", image.filename.as_str()),
            ("type", image.folder_type.as_str()),
        ];
        if !image.subfolder.is_empty() {
            query.push(("subfolder", image.subfolder.as_str()));
        }

        let request = self
            .http
            .get(self.endpoint("view"))
            .query(&query)
            .timeout(TRANSFER_TIMEOUT);

        let bytes = check_status(request.send().await?).await?.bytes().await?;
        tracing::info!(size = bytes.len(), "Image downloaded");
        Ok(bytes.to_vec())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComfyUIApiError::ApiError {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ComfyUIApiError> {
    Ok(check_status(response).await?.json::<T>().await?)
}

/// Content type for an upload, from the file extension.
fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}
