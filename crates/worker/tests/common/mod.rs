//! Fakes shared by the worker integration tests.
//!
//! [`FakeBackend`] decides what to do from the job's prompt text, which the
//! workflow builder writes into the positive prompt node:
//!
//! | prompt    | behaviour                                    |
//! |-----------|----------------------------------------------|
//! | `slow`    | tracking never finishes                      |
//! | `empty`   | completes without any output image           |
//! | `explode` | tracking fails with an execution error       |
//! | `ghost`   | the result image cannot be downloaded        |
//! | other     | two progress steps, one image `<prompt>.png` |
//!
//! Uploads fail for input files named `missing.png` and take 100ms for
//! `large.png`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use editbot_comfyui::api::ComfyUIApiError;
use editbot_comfyui::history::{ImageRef, NodeOutputs};
use editbot_comfyui::tracker::{
    CompletionSource, ProgressListener, TrackError, TrackOutcome, TrackStatus,
};
use editbot_comfyui::workflow::{BuiltWorkflow, WorkflowBuilder};
use editbot_core::job::{DeliveryTarget, Job, JobStatus};
use editbot_core::params::{EditParams, ParamDefaults};
use editbot_core::progress::ProgressSnapshot;
use editbot_core::types::ChatRef;
use editbot_worker::processor::{GenerationBackend, Processor, ProcessorConfig};
use editbot_worker::queue::JobQueue;
use editbot_worker::sink::{DeliverySink, ResultMetadata, SinkError};

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct FakeBackend {
    /// Simulated generation time for ordinary prompts.
    pub delay: Duration,
    /// Prompt ids in submission order.
    pub submissions: Mutex<Vec<String>>,
    /// Timeout handed to each `track` call.
    pub track_timeouts: Mutex<Vec<Duration>>,
}

impl FakeBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            submissions: Mutex::new(Vec::new()),
            track_timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<String> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn track_timeouts(&self) -> Vec<Duration> {
        self.track_timeouts.lock().unwrap().clone()
    }
}

fn image_output(filename: &str) -> Value {
    json!({"images": [{"filename": filename, "subfolder": "", "type": "output"}]})
}

fn outcome(prompt_id: &str, outputs: NodeOutputs) -> TrackOutcome {
    let status = if outputs.is_empty() {
        TrackStatus::CompletedNoOutput
    } else {
        TrackStatus::Completed
    };
    TrackOutcome {
        prompt_id: prompt_id.to_string(),
        outputs,
        status,
        source: CompletionSource::Stream,
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn upload(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        if path.file_name().is_some_and(|n| n == "missing.png") {
            return Err(ComfyUIApiError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "input image is gone",
            )));
        }
        if path.file_name().is_some_and(|n| n == "large.png") {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    async fn submit(&self, workflow: &BuiltWorkflow) -> Result<String, ComfyUIApiError> {
        let prompt = workflow.document["119"]["inputs"]["prompt"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.submissions.lock().unwrap().push(prompt.clone());
        Ok(prompt)
    }

    async fn track(
        &self,
        prompt_id: &str,
        listener: &dyn ProgressListener,
        timeout: Duration,
    ) -> Result<TrackOutcome, TrackError> {
        self.track_timeouts.lock().unwrap().push(timeout);
        match prompt_id {
            "slow" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(outcome(prompt_id, NodeOutputs::new()))
            }
            "empty" => Ok(outcome(prompt_id, NodeOutputs::new())),
            "explode" => Err(TrackError::Execution {
                node_id: "121".into(),
                message: "CUDA out of memory".into(),
            }),
            _ => {
                for step in 1..=2 {
                    tokio::time::sleep(self.delay / 2).await;
                    let _ = listener.on_progress(ProgressSnapshot::new(step, 2)).await;
                }
                let mut outputs = NodeOutputs::new();
                outputs.insert("102".into(), image_output(&format!("{prompt_id}.png")));
                Ok(outcome(prompt_id, outputs))
            }
        }
    }

    async fn download(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        if image.filename == "ghost.png" {
            return Err(ComfyUIApiError::ApiError {
                status: 404,
                body: "not found".into(),
            });
        }
        Ok(format!("image:{}", image.filename).into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Notice {
        chat_id: ChatRef,
        text: String,
    },
    Result {
        chat_id: ChatRef,
        path: PathBuf,
        metadata: ResultMetadata,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    pub deliveries: Mutex<Vec<Delivery>>,
    pub fail_notify: bool,
    pub fail_results: bool,
    /// Time each result delivery takes.
    pub result_delay: Duration,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Notices sent to `chat_id`, in order.
    pub fn notices_for(&self, chat_id: ChatRef) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Notice { chat_id: c, text } if c == chat_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn failure_notices_for(&self, chat_id: ChatRef) -> Vec<String> {
        self.notices_for(chat_id)
            .into_iter()
            .filter(|t| t.starts_with("❌"))
            .collect()
    }

    pub fn results(&self) -> Vec<(ChatRef, PathBuf, ResultMetadata)> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Result {
                    chat_id,
                    path,
                    metadata,
                } => Some((chat_id, path, metadata)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn notify(&self, target: &DeliveryTarget, text: &str) -> Result<(), SinkError> {
        if self.fail_notify {
            return Err(SinkError::HttpStatus(503));
        }
        self.deliveries.lock().unwrap().push(Delivery::Notice {
            chat_id: target.chat_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn deliver_result(
        &self,
        target: &DeliveryTarget,
        asset: &Path,
        metadata: &ResultMetadata,
    ) -> Result<(), SinkError> {
        tokio::time::sleep(self.result_delay).await;
        if self.fail_results {
            return Err(SinkError::HttpStatus(502));
        }
        self.deliveries.lock().unwrap().push(Delivery::Result {
            chat_id: target.chat_id,
            path: asset.to_path_buf(),
            metadata: metadata.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// API-format template containing every node the builder writes to.
pub fn template() -> Value {
    json!({
        "78": {"class_type": "LoadImage", "inputs": {"image": "placeholder.png"}},
        "119": {"class_type": "TextEncodeQwenImageEditPlus", "inputs": {"prompt": ""}},
        "77": {"class_type": "TextEncodeQwenImageEdit", "inputs": {"prompt": ""}},
        "117": {"class_type": "PrimitiveInt", "inputs": {"value": 1}},
        "115": {"class_type": "INTConstant", "inputs": {"value": 4}},
        "121": {"class_type": "ClownsharKSampler_Beta", "inputs": {"steps": ["115", 0], "cfg": 1.0}},
        "102": {"class_type": "Image Saver Simple", "inputs": {"images": ["121", 0]}}
    })
}

pub fn workflows() -> Arc<WorkflowBuilder> {
    Arc::new(WorkflowBuilder::from_values(template(), None).unwrap())
}

/// Pending job for `user_id` (also used as chat id) with default parameters.
pub fn job(user_id: ChatRef, prompt: &str) -> Job {
    job_with_image(user_id, prompt, "/inputs/photo.png")
}

pub fn job_with_image(user_id: ChatRef, prompt: &str, image: &str) -> Job {
    let target = DeliveryTarget {
        user_id,
        chat_id: user_id,
        message_id: 10,
    };
    Job::new(
        target,
        image,
        EditParams::with_defaults(prompt, &ParamDefaults::default()),
    )
}

pub fn config(output_dir: &Path, job_timeout: Duration) -> ProcessorConfig {
    ProcessorConfig {
        job_timeout,
        output_dir: output_dir.to_path_buf(),
        output_node: "102".to_string(),
    }
}

pub fn processor(
    queue: &Arc<JobQueue>,
    backend: &Arc<FakeBackend>,
    sink: &Arc<RecordingSink>,
    config: ProcessorConfig,
) -> Processor {
    Processor::new(
        Arc::clone(queue),
        Arc::clone(backend) as Arc<dyn GenerationBackend>,
        workflows(),
        Arc::clone(sink) as Arc<dyn DeliverySink>,
        config,
    )
}

/// Poll until history holds `count` jobs; panics after `within`.
pub async fn wait_for_history(queue: &JobQueue, count: usize, within: Duration) -> Vec<Job> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let history = queue.history().await;
        if history.len() >= count {
            return history;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history has {} of {count} jobs after {within:?}",
            history.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until some job is being processed.
pub async fn wait_until_busy(queue: &JobQueue) {
    for _ in 0..500 {
        if queue.status().await.current_job.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("processor never picked up a job");
}

pub fn assert_terminal(job: &Job, status: JobStatus) {
    assert_eq!(job.status, status, "job {} ({:?})", job.id, job.outcome);
    assert!(job.completed_at.is_some());
}
