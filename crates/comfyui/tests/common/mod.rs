//! In-process fake ComfyUI used by the integration tests.
//!
//! Serves `/system_stats`, `/upload/image`, `/prompt`, `/history/{id}`,
//! `/view` and a scripted `/ws` event stream on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use editbot_comfyui::client::ComfyUIClient;
use editbot_comfyui::tracker::TrackerConfig;

/// One action of the scripted event stream.
#[derive(Clone)]
pub enum Step {
    /// Send a JSON text frame.
    Send(Value),
    /// Pause before the next step.
    Sleep(Duration),
    /// Replace the `/history` response body.
    SetHistory(Value),
    /// Send a close frame and end the stream.
    Close,
}

#[derive(Clone)]
pub struct FakeComfy {
    script: Arc<Mutex<Vec<Step>>>,
    history: Arc<Mutex<Value>>,
    failing_probes: Arc<AtomicU32>,
    pub probes: Arc<AtomicU32>,
    pub submissions: Arc<Mutex<Vec<Value>>>,
    pub ws_client_ids: Arc<Mutex<Vec<String>>>,
}

impl FakeComfy {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Vec::new())),
            history: Arc::new(Mutex::new(json!({}))),
            failing_probes: Arc::new(AtomicU32::new(0)),
            probes: Arc::new(AtomicU32::new(0)),
            submissions: Arc::new(Mutex::new(Vec::new())),
            ws_client_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        *self.script.lock().unwrap() = steps;
        self
    }

    pub fn with_history(self, body: Value) -> Self {
        *self.history.lock().unwrap() = body;
        self
    }

    /// The first `n` health probes answer 503.
    pub fn with_failing_probes(self, n: u32) -> Self {
        self.failing_probes.store(n, Ordering::SeqCst);
        self
    }

    /// Bind to an ephemeral port and serve in the background.
    pub async fn spawn(&self) -> u16 {
        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(submit_prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(event_stream))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }
}

/// Client with short tracker timings, pointed at `port`.
pub fn fast_client(port: u16) -> ComfyUIClient {
    ComfyUIClient::from_host("127.0.0.1", port).with_tracker_config(TrackerConfig {
        read_timeout: Duration::from_millis(50),
        fallback_interval: Duration::from_millis(100),
        history_timeout: Duration::from_secs(1),
    })
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

pub fn progress(prompt_id: Option<&str>, value: u32, max: u32) -> Value {
    let mut data = json!({"value": value, "max": max, "node": "121"});
    if let Some(id) = prompt_id {
        data["prompt_id"] = json!(id);
    }
    json!({"type": "progress", "data": data})
}

pub fn executing(prompt_id: &str, node: Option<&str>) -> Value {
    json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}})
}

pub fn executed(prompt_id: &str, node: &str, filename: &str) -> Value {
    json!({
        "type": "executed",
        "data": {
            "node": node,
            "prompt_id": prompt_id,
            "output": {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}
        }
    })
}

pub fn execution_error(prompt_id: &str, node_id: &str, message: &str) -> Value {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": node_id,
            "exception_message": message,
            "exception_type": "RuntimeError"
        }
    })
}

/// `/history` body for a finished prompt with one image on `node`.
pub fn completed_history(prompt_id: &str, node: &str, filename: &str) -> Value {
    json!({
        prompt_id: {
            "outputs": {node: {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true}
        }
    })
}

/// `/history` body for a finished prompt that produced nothing.
pub fn completed_history_without_outputs(prompt_id: &str) -> Value {
    json!({
        prompt_id: {
            "outputs": {},
            "status": {"status_str": "success", "completed": true}
        }
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn system_stats(State(fake): State<FakeComfy>) -> Response {
    let n = fake.probes.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= fake.failing_probes.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({"system": {"os": "posix", "comfyui_version": "0.3.0"}, "devices": []})).into_response()
}

async fn upload_image(mut multipart: Multipart) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("image") {
            let name = field.file_name().unwrap_or("unnamed").to_string();
            let bytes = field.bytes().await.unwrap_or_default();
            if bytes.is_empty() {
                break;
            }
            return Json(json!({"name": name, "subfolder": "", "type": "input"})).into_response();
        }
    }
    (StatusCode::BAD_REQUEST, "no image field").into_response()
}

async fn submit_prompt(State(fake): State<FakeComfy>, Json(body): Json<Value>) -> Response {
    fake.submissions.lock().unwrap().push(body.clone());
    if !body["prompt"].is_object() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid prompt"}))).into_response();
    }
    Json(json!({"prompt_id": "p-test", "number": 1, "node_errors": {}})).into_response()
}

async fn history(State(fake): State<FakeComfy>, Path(_prompt_id): Path<String>) -> Json<Value> {
    Json(fake.history.lock().unwrap().clone())
}

async fn view(Query(query): Query<HashMap<String, String>>) -> Response {
    let filename = query.get("filename").cloned().unwrap_or_default();
    if filename == "missing.png" {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let folder_type = query.get("type").cloned().unwrap_or_default();
    let subfolder = query.get("subfolder").cloned().unwrap_or_default();
    format!("{filename}|{folder_type}|{subfolder}").into_response()
}

async fn event_stream(
    State(fake): State<FakeComfy>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(id) = query.get("clientId") {
        fake.ws_client_ids.lock().unwrap().push(id.clone());
    }
    ws.on_upgrade(move |socket| play_script(socket, fake))
}

async fn play_script(mut socket: WebSocket, fake: FakeComfy) {
    let script = fake.script.lock().unwrap().clone();
    for step in script {
        match step {
            Step::Send(message) => {
                if socket.send(Message::Text(message.to_string().into())).await.is_err() {
                    return;
                }
            }
            Step::Sleep(pause) => tokio::time::sleep(pause).await,
            Step::SetHistory(body) => *fake.history.lock().unwrap() = body,
            Step::Close => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        }
    }
    // Keep the stream open until the client goes away.
    while let Some(Ok(_)) = socket.recv().await {}
}
