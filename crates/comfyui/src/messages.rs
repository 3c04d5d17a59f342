//! Events read from the ComfyUI `/ws` stream.
//!
//! Every text frame is `{"type": "<kind>", "data": {...}}`. Only the kinds
//! the tracker reacts to are modelled; anything else (custom node
//! monitors, previews) fails to parse and is skipped by the caller.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Server-wide queue broadcast. Kept raw, only the depth is read.
    Status(Value),

    ExecutionStart {
        prompt_id: String,
    },

    ExecutionCached {
        prompt_id: String,
        #[serde(default)]
        nodes: Vec<String>,
    },

    /// `node: null` means the whole prompt has finished.
    Executing {
        prompt_id: String,
        node: Option<String>,
    },

    Progress(StepUpdate),

    Executed {
        prompt_id: String,
        node: String,
        #[serde(default)]
        output: Value,
    },

    ExecutionError(NodeFailure),

    /// Newer servers send this after the last node instead of relying on
    /// `executing` with a null node alone.
    ExecutionSuccess {
        prompt_id: String,
    },

    ExecutionInterrupted {
        prompt_id: String,
    },
}

impl StreamEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Prompt the event belongs to, if it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::Progress(update) => update.prompt_id.as_deref(),
            Self::ExecutionError(failure) => failure.prompt_id.as_deref(),
            Self::ExecutionStart { prompt_id }
            | Self::ExecutionCached { prompt_id, .. }
            | Self::Executing { prompt_id, .. }
            | Self::Executed { prompt_id, .. }
            | Self::ExecutionSuccess { prompt_id }
            | Self::ExecutionInterrupted { prompt_id } => Some(prompt_id),
        }
    }

    /// Pending prompts reported by a `status` event.
    pub fn queue_remaining(&self) -> Option<u64> {
        match self {
            Self::Status(data) => data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(Value::as_u64),
            _ => None,
        }
    }
}

/// Sampler step counter. Old servers omit `prompt_id` here.
#[derive(Debug, Clone, Deserialize)]
pub struct StepUpdate {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Failure report for a node. Some servers leave out `prompt_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeFailure {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default = "NodeFailure::unknown")]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl NodeFailure {
    fn unknown() -> String {
        "Unknown error".to_string()
    }
}
