//! Job specification builder.
//!
//! Fills an API-format workflow template with one job's parameters. The
//! template is never mutated; every build works on a deep copy.

use std::path::Path;

use serde_json::{json, Value};

use editbot_core::params::{resolve_seed, EditParams};

/// Node ids of the template nodes the builder writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMap {
    pub load_image: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub seed: String,
    pub steps: String,
    pub sampler: String,
    pub output: String,
}

impl Default for NodeMap {
    fn default() -> Self {
        Self {
            load_image: "78".into(),
            positive_prompt: "119".into(),
            negative_prompt: "77".into(),
            seed: "117".into(),
            steps: "115".into(),
            sampler: "121".into(),
            output: "102".into(),
        }
    }
}

impl NodeMap {
    /// `(node id, role)` pairs every usable template must contain.
    fn required(&self) -> [(&str, &'static str); 7] {
        [
            (self.load_image.as_str(), "load image"),
            (self.positive_prompt.as_str(), "positive prompt"),
            (self.negative_prompt.as_str(), "negative prompt"),
            (self.seed.as_str(), "seed"),
            (self.steps.as_str(), "steps"),
            (self.sampler.as_str(), "sampler"),
            (self.output.as_str(), "output"),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid workflow JSON: {0}")]
    Parse(String),

    #[error("Workflow template is missing nodes: {}", .0.join(", "))]
    MissingNodes(Vec<String>),
}

/// A filled-in workflow ready for submission.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    /// API-format document for `POST /prompt`.
    pub document: Value,
    /// `{"workflow": <ui document>}` when a UI workflow was loaded.
    pub extra_pnginfo: Option<Value>,
    /// Seed written into the document (random seeds already resolved).
    pub seed: u64,
}

#[derive(Debug)]
pub struct WorkflowBuilder {
    template: Value,
    ui_workflow: Option<Value>,
    nodes: NodeMap,
}

impl WorkflowBuilder {
    /// Load the API template and, optionally, the UI-format workflow.
    pub fn from_files(template_path: &Path, ui_path: Option<&Path>) -> Result<Self, WorkflowError> {
        let template = read_json(template_path)?;
        let ui_workflow = ui_path.map(read_json).transpose()?;

        let builder = Self::from_values(template, ui_workflow)?;
        tracing::info!(
            path = %template_path.display(),
            nodes = builder.node_count(),
            ui_workflow = builder.ui_workflow.is_some(),
            "Workflow template loaded",
        );
        Ok(builder)
    }

    /// Wrap already-parsed documents. `template` must be an object keyed by
    /// node id. Uses the default [`NodeMap`].
    pub fn from_values(template: Value, ui_workflow: Option<Value>) -> Result<Self, WorkflowError> {
        if !template.is_object() {
            return Err(WorkflowError::Parse(
                "template must be a JSON object keyed by node id".into(),
            ));
        }
        Ok(Self {
            template,
            ui_workflow,
            nodes: NodeMap::default(),
        })
    }

    /// Replace the node ids the builder writes to and validates against.
    pub fn with_node_map(mut self, nodes: NodeMap) -> Self {
        self.nodes = nodes;
        self
    }

    /// Node ids in use.
    pub fn node_map(&self) -> &NodeMap {
        &self.nodes
    }

    /// Number of nodes in the API template.
    pub fn node_count(&self) -> usize {
        self.template.as_object().map_or(0, |m| m.len())
    }

    /// Check that every node the builder writes to exists in the template.
    pub fn validate_template(&self) -> Result<(), WorkflowError> {
        let missing: Vec<String> = self
            .nodes
            .required()
            .iter()
            .filter(|(id, _)| self.template.get(*id).is_none())
            .map(|(id, role)| format!("{id} ({role})"))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            tracing::error!(missing = ?missing, "Workflow template validation failed");
            Err(WorkflowError::MissingNodes(missing))
        }
    }

    /// Fill a copy of the template with `params` and the uploaded image name.
    ///
    /// Fails only when the image loader node is missing, since the document
    /// would not reference the input at all. Other absent nodes are logged
    /// and skipped.
    pub fn build(
        &self,
        params: &EditParams,
        input_image: &str,
    ) -> Result<BuiltWorkflow, WorkflowError> {
        let nodes = &self.nodes;
        if self.template.get(&nodes.load_image).is_none() {
            return Err(WorkflowError::MissingNodes(vec![format!(
                "{} (load image)",
                nodes.load_image
            )]));
        }

        let mut doc = self.template.clone();
        let seed = resolve_seed(params.seed);

        set_input(&mut doc, &nodes.load_image, "image", json!(input_image));
        set_input(&mut doc, &nodes.positive_prompt, "prompt", json!(params.positive_prompt));
        set_input(&mut doc, &nodes.negative_prompt, "prompt", json!(params.negative_prompt));
        set_input(&mut doc, &nodes.seed, "value", json!(seed));
        set_input(&mut doc, &nodes.steps, "value", json!(params.steps));

        // The sampler usually links its steps to the steps node as
        // `["115", 0]`; only a literal value is overwritten.
        let steps_is_link = doc
            .get(&nodes.sampler)
            .and_then(|n| n.get("inputs"))
            .and_then(|i| i.get("steps"))
            .is_some_and(Value::is_array);
        if !steps_is_link {
            set_input(&mut doc, &nodes.sampler, "steps", json!(params.steps));
        }

        set_input(&mut doc, &nodes.sampler, "cfg", json!(params.cfg));
        set_input(&mut doc, &nodes.sampler, "sampler_name", json!(params.sampler));
        set_input(&mut doc, &nodes.sampler, "scheduler", json!(params.scheduler));
        set_input(&mut doc, &nodes.sampler, "eta", json!(params.eta));
        set_input(&mut doc, &nodes.sampler, "denoise", json!(params.denoise));

        tracing::debug!(seed, steps = params.steps, cfg = params.cfg, "Workflow built");

        Ok(BuiltWorkflow {
            document: doc,
            extra_pnginfo: self.ui_workflow.as_ref().map(|ui| json!({ "workflow": ui })),
            seed,
        })
    }
}

fn read_json(path: &Path) -> Result<Value, WorkflowError> {
    let raw = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| WorkflowError::Parse(format!("{}: {e}", path.display())))
}

/// Write `inputs[key]` on `node`, logging when the node is absent.
fn set_input(doc: &mut Value, node: &str, key: &str, value: Value) {
    let inputs = doc
        .get_mut(node)
        .and_then(|n| n.as_object_mut())
        .map(|n| n.entry("inputs").or_insert_with(|| json!({})))
        .and_then(Value::as_object_mut);

    match inputs {
        Some(inputs) => {
            inputs.insert(key.to_string(), value);
        }
        None => tracing::warn!(node, key, "Workflow node not found, skipping"),
    }
}
