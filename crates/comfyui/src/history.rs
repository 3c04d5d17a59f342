//! History-record parsing and output extraction.
//!
//! `GET /history/{prompt_id}` returns `{"<prompt_id>": {"outputs": {...},
//! "status": {"completed": bool, "status_str": "..."}}}`, or `{}` while the
//! backend has no record. Node outputs have the same shape whether they
//! arrive through `executed` events or through the history record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node outputs keyed by the producing node id.
pub type NodeOutputs = BTreeMap<String, serde_json::Value>;

/// The backend's durable record of one prompt execution.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub prompt_id: String,
    /// `true` once the backend has finished executing the prompt.
    pub completed: bool,
    /// Backend status string (`"success"`, `"error"`), when reported.
    pub status: Option<String>,
    pub outputs: NodeOutputs,
}

/// Extract the record for `prompt_id` from a `/history` response body.
///
/// Returns `None` when the body has no entry for the prompt.
pub fn parse_history_record(body: &serde_json::Value, prompt_id: &str) -> Option<HistoryRecord> {
    let entry = body.get(prompt_id)?;
    let status = entry.get("status");

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(|c| c.as_bool())
        .unwrap_or(false);
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(|s| s.as_str())
        .map(str::to_string);

    let outputs = entry
        .get("outputs")
        .and_then(|o| o.as_object())
        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Some(HistoryRecord {
        prompt_id: prompt_id.to_string(),
        completed,
        status: status_str,
        outputs,
    })
}

/// Reference to a file stored by the backend, as listed in node outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage class: `output`, `input`, or `temp`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// First image listed by `node` in `outputs`, if any.
fn first_image_of(outputs: &NodeOutputs, node: &str) -> Option<ImageRef> {
    let images = outputs.get(node)?.get("images")?.as_array()?;
    images
        .iter()
        .find_map(|img| serde_json::from_value::<ImageRef>(img.clone()).ok())
}

/// Pick the result image: the first image of `preferred_node`, otherwise
/// the first image of any node in node-id order.
pub fn select_image(outputs: &NodeOutputs, preferred_node: &str) -> Option<ImageRef> {
    first_image_of(outputs, preferred_node)
        .or_else(|| outputs.keys().find_map(|node| first_image_of(outputs, node)))
}
