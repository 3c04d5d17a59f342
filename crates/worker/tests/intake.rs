//! HTTP intake tests through the full middleware stack.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use editbot_core::params::{ParamDefaults, ParamLimits};
use editbot_worker::intake::{self, IntakeState};
use editbot_worker::queue::{JobQueue, QueueConfig};

struct TestApp {
    app: Router,
    queue: Arc<JobQueue>,
    image: PathBuf,
    _dir: tempfile::TempDir,
}

fn test_app(max_size: usize) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("photo.jpg");
    std::fs::write(&image, b"jpeg").unwrap();

    let queue = Arc::new(JobQueue::new(QueueConfig {
        max_size,
        ..QueueConfig::default()
    }));
    let state = IntakeState {
        queue: Arc::clone(&queue),
        defaults: Arc::new(ParamDefaults::default()),
        limits: Arc::new(ParamLimits::default()),
    };

    TestApp {
        app: intake::router(state, Duration::from_secs(30)),
        queue,
        image,
        _dir: dir,
    }
}

impl TestApp {
    fn job_body(&self, user_id: i64, extra: Value) -> Value {
        let mut body = json!({
            "user_id": user_id,
            "chat_id": user_id,
            "message_id": 100,
            "image_path": self.image,
            "prompt": "make it snowy",
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                body.insert(k.clone(), v.clone());
            }
        }
        body
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn submit(&self, user_id: i64, extra: Value) -> (StatusCode, Value) {
        let body = self.job_body(user_id, extra);
        self.send(Method::POST, "/api/v1/jobs", Some(body)).await
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok_and_version() {
    let t = test_app(10);
    let (status, body) = t.send(Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let t = test_app(10);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_jobs_are_queued_in_order() {
    let t = test_app(10);

    let (status, first) = t.submit(1, json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["data"]["position"], 1);
    assert!(first["data"]["job_id"].is_string());

    let (_, second) = t.submit(2, json!({"steps": 12, "seed": 99})).await;
    assert_eq!(second["data"]["position"], 2);

    let (status, queue) = t.send(Method::GET, "/api/v1/queue", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["data"]["queue_size"], 2);
    assert_eq!(queue["data"]["capacity"], 10);
    assert_eq!(queue["data"]["success_rate"], 0.0);
}

#[tokio::test]
async fn overrides_are_merged_with_defaults() {
    let t = test_app(10);
    t.submit(1, json!({"steps": 20, "cfg": 2.5, "negative_prompt": "blurry"}))
        .await;

    let job = t.queue.find_by_user(1).await.unwrap();
    assert_eq!(job.params.steps, 20);
    assert_eq!(job.params.cfg, 2.5);
    assert_eq!(job.params.negative_prompt, "blurry");
    assert_eq!(job.params.sampler, ParamDefaults::default().sampler);
    assert_eq!(job.target.message_id, 100);
}

#[tokio::test]
async fn out_of_range_parameters_are_rejected_before_admission() {
    let t = test_app(10);
    let (status, body) = t.submit(1, json!({"steps": 500})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"], "Steps must be between 1 and 50");
    assert_eq!(t.queue.status().await.queue_size, 0);
}

#[tokio::test]
async fn empty_prompt_is_a_bad_request() {
    let t = test_app(10);
    let (status, body) = t.submit(1, json!({"prompt": ""})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn blank_prompt_is_rejected() {
    let t = test_app(10);
    let (status, body) = t.submit(1, json!({"prompt": "   "})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn missing_input_image_is_rejected() {
    let t = test_app(10);
    let (status, body) = t
        .submit(1, json!({"image_path": "/definitely/not/here.jpg"}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Input image not found"));
}

#[tokio::test]
async fn full_queue_answers_429() {
    let t = test_app(1);
    assert_eq!(t.submit(1, json!({})).await.0, StatusCode::ACCEPTED);

    let (status, body) = t.submit(2, json!({})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "QUEUE_FULL");
    assert_eq!(t.queue.status().await.queue_size, 1);
}

// ---------------------------------------------------------------------------
// Per-user job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_job_lookup() {
    let t = test_app(10);
    let (_, created) = t.submit(42, json!({})).await;

    let (status, body) = t.send(Method::GET, "/api/v1/users/42/job", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["job_id"], created["data"]["job_id"]);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["prompt"], "make it snowy");

    let (status, body) = t.send(Method::GET, "/api/v1/users/7/job", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn pending_job_can_be_cancelled_once() {
    let t = test_app(10);
    t.submit(42, json!({})).await;

    let (status, _) = t.send(Method::DELETE, "/api/v1/users/42/job", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.queue.status().await.queue_size, 0);

    let (status, _) = t.send(Method::DELETE, "/api/v1/users/42/job", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn running_job_cannot_be_cancelled() {
    let t = test_app(10);
    t.submit(42, json!({})).await;
    let running = t.queue.dequeue().await;

    let (status, body) = t.send(Method::DELETE, "/api/v1/users/42/job", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (_, body) = t.send(Method::GET, "/api/v1/users/42/job", None).await;
    assert_eq!(body["data"]["job_id"], running.id.to_string());
    assert_eq!(body["data"]["status"], "processing");
}
