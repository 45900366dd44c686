//! ComfyUI backend.
//!
//! [`ComfyUIApi`] wraps the ComfyUI HTTP endpoints (workflow submission,
//! queue deletion, history retrieval, output download) using [`reqwest`].
//! [`ComfyUIAdapter`] translates the generation contract onto it: the
//! segment prompt is injected into the workflow carried in
//! `model_params.workflow` after the workflow passes [`WorkflowVetting`].

use std::time::Duration;

use async_trait::async_trait;
use foundry_core::taxonomy::{ErrorCode, FailureDetail};
use serde::Deserialize;
use serde_json::Value;

use crate::adapter::{ExternalJobId, GenerationAdapter, PollStatus};
use crate::error::AdapterError;
use crate::vetting::WorkflowVetting;

/// Node id that receives the prompt when `model_params.prompt_node_id` is
/// absent.
const DEFAULT_PROMPT_NODE_ID: &str = "6";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Output keys checked in order of preference.
const MEDIA_KEYS: [&str; 3] = ["videos", "gifs", "images"];

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

impl ComfyUIApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, api_url))
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `POST /prompt`.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, AdapterError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.json::<SubmitResponse>().await?)
    }

    /// `POST /queue` asking ComfyUI to delete `prompt_id`.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), AdapterError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    /// `GET /history/{prompt_id}`. Empty until the prompt has finished.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, AdapterError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<Value>().await?)
    }

    /// `GET` an absolute `/view` URL built by [`view_url`](Self::view_url).
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Download URL for one output file.
    pub fn view_url(&self, file: &OutputFile) -> Result<String, AdapterError> {
        let mut url = reqwest::Url::parse(&format!("{}/view", self.api_url))
            .map_err(|e| AdapterError::InvalidParameters(format!("bad ComfyUI URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("filename", &file.filename)
            .append_pair("subfolder", &file.subfolder)
            .append_pair("type", &file.kind);
        Ok(url.into())
    }

    /// Map a non-2xx response onto the taxonomy. A 400 from ComfyUI means
    /// the workflow failed validation; its body names missing node types.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let message = format!("ComfyUI API error ({}): {body}", status.as_u16());

        Err(if status.is_server_error() {
            AdapterError::Generation(message)
        } else if body.contains("missing_node_type") || body.contains("not found") {
            AdapterError::UnsupportedCapability(message)
        } else {
            AdapterError::InvalidParameters(message)
        })
    }
}

// ---------------------------------------------------------------------------
// Workflow and history handling
// ---------------------------------------------------------------------------

/// A file listed under a node's outputs in `/history`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

/// What a `/history/{prompt_id}` response says about a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    Pending,
    Failed(FailureDetail),
    Finished(OutputFile),
}

/// Copy `workflow` and write the prompt (and optional width/height) into
/// its nodes.
///
/// The prompt goes to `inputs.text` of node `model_params.prompt_node_id`
/// (default `"6"`); `width`/`height` go to node
/// `model_params.sampler_node_id` when both are given.
pub fn inject_prompt(
    workflow: &Value,
    prompt: &str,
    model_params: &Value,
) -> Result<Value, AdapterError> {
    let mut workflow = workflow.clone();
    let nodes = workflow.as_object_mut().ok_or_else(|| {
        AdapterError::InvalidParameters("workflow must be a JSON object of nodes".into())
    })?;

    let prompt_node_id = model_params
        .get("prompt_node_id")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROMPT_NODE_ID);
    let inputs = nodes
        .get_mut(prompt_node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            AdapterError::InvalidParameters(format!(
                "workflow has no prompt node '{prompt_node_id}' with inputs"
            ))
        })?;
    inputs.insert("text".into(), Value::String(prompt.to_string()));

    if let Some(sampler_id) = model_params.get("sampler_node_id").and_then(Value::as_str) {
        if let Some(inputs) = nodes
            .get_mut(sampler_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            for dim in ["width", "height"] {
                if let Some(value) = model_params.get(dim) {
                    inputs.insert(dim.into(), value.clone());
                }
            }
        }
    }

    Ok(workflow)
}

/// Interpret a `/history/{prompt_id}` response.
pub fn interpret_history(history: &Value, prompt_id: &str) -> HistoryState {
    let Some(entry) = history.get(prompt_id) else {
        return HistoryState::Pending;
    };

    let status = entry.get("status");
    if status.and_then(|s| s.get("status_str")).and_then(Value::as_str) == Some("error") {
        let message = status
            .and_then(|s| s.get("messages"))
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages.iter().find_map(|m| {
                    (m.get(0).and_then(Value::as_str) == Some("execution_error"))
                        .then(|| m.get(1)?.get("exception_message")?.as_str())
                        .flatten()
                })
            })
            .unwrap_or("ComfyUI execution error");
        return HistoryState::Failed(FailureDetail::new(message));
    }

    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return HistoryState::Pending;
    };

    for key in MEDIA_KEYS {
        let file = outputs.values().find_map(|node| {
            let first = node.get(key)?.as_array()?.first()?;
            serde_json::from_value::<OutputFile>(first.clone()).ok()
        });
        if let Some(file) = file {
            return HistoryState::Finished(file);
        }
    }

    HistoryState::Failed(
        FailureDetail::new("No video output was generated").with_code(ErrorCode::OutputValidation),
    )
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// [`GenerationAdapter`] for a ComfyUI instance.
pub struct ComfyUIAdapter {
    api: ComfyUIApi,
    vetting: WorkflowVetting,
    default_workflow: Option<Value>,
}

impl ComfyUIAdapter {
    pub fn new(api_url: impl Into<String>, vetting: WorkflowVetting) -> Result<Self, AdapterError> {
        Ok(Self::from_api(ComfyUIApi::new(api_url)?, vetting))
    }

    pub fn from_api(api: ComfyUIApi, vetting: WorkflowVetting) -> Self {
        Self {
            api,
            vetting,
            default_workflow: None,
        }
    }

    /// Workflow used when `model_params` carries none.
    pub fn with_default_workflow(mut self, workflow: Value) -> Self {
        self.default_workflow = Some(workflow);
        self
    }
}

#[async_trait]
impl GenerationAdapter for ComfyUIAdapter {
    fn backend(&self) -> &str {
        "comfyui"
    }

    async fn initiate(
        &self,
        prompt: &str,
        model_params: &Value,
    ) -> Result<ExternalJobId, AdapterError> {
        let workflow = model_params
            .get("workflow")
            .or(self.default_workflow.as_ref())
            .ok_or_else(|| {
                AdapterError::InvalidParameters(
                    "no workflow in model_params and no default workflow configured".into(),
                )
            })?;
        self.vetting.vet(workflow)?;
        let workflow = inject_prompt(workflow, prompt, model_params)?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let submitted = self.api.submit_workflow(&workflow, &client_id).await?;
        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Submitted workflow to ComfyUI",
        );
        Ok(submitted.prompt_id)
    }

    async fn poll(&self, external_job_id: &str) -> Result<PollStatus, AdapterError> {
        let history = self.api.get_history(external_job_id).await?;
        Ok(match interpret_history(&history, external_job_id) {
            HistoryState::Pending => PollStatus::Running,
            HistoryState::Failed(detail) => PollStatus::Failed { detail },
            HistoryState::Finished(file) => PollStatus::Succeeded {
                artifact_ref: self.api.view_url(&file)?,
            },
        })
    }

    async fn cancel(&self, external_job_id: &str) -> Result<(), AdapterError> {
        self.api.cancel_execution(external_job_id).await
    }

    async fn fetch_artifact(&self, artifact_ref: &str) -> Result<Vec<u8>, AdapterError> {
        if !artifact_ref.starts_with(self.api.api_url()) {
            return Err(AdapterError::Output(format!(
                "artifact '{artifact_ref}' is not served by this ComfyUI instance"
            )));
        }
        self.api.download(artifact_ref).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn workflow() -> Value {
        json!({
            "3": { "class_type": "KSampler", "inputs": { "seed": 1 } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
        })
    }

    #[test]
    fn injects_prompt_into_default_node() {
        let out = inject_prompt(&workflow(), "a red fox", &json!({})).unwrap();
        assert_eq!(out["6"]["inputs"]["text"], "a red fox");
        assert_eq!(out["3"]["inputs"]["seed"], 1);
    }

    #[test]
    fn injects_dimensions_into_sampler() {
        let params = json!({ "sampler_node_id": "3", "width": 640, "height": 360 });
        let out = inject_prompt(&workflow(), "p", &params).unwrap();
        assert_eq!(out["3"]["inputs"]["width"], 640);
        assert_eq!(out["3"]["inputs"]["height"], 360);
    }

    #[test]
    fn missing_prompt_node_is_invalid() {
        let params = json!({ "prompt_node_id": "99" });
        assert_matches!(
            inject_prompt(&workflow(), "p", &params),
            Err(AdapterError::InvalidParameters(_))
        );
        assert_matches!(
            inject_prompt(&json!([]), "p", &json!({})),
            Err(AdapterError::InvalidParameters(_))
        );
    }

    #[test]
    fn history_states() {
        assert_eq!(interpret_history(&json!({}), "abc"), HistoryState::Pending);

        let running = json!({ "abc": { "status": { "status_str": "success", "completed": false } } });
        assert_eq!(interpret_history(&running, "abc"), HistoryState::Pending);

        let failed = json!({ "abc": { "status": {
            "status_str": "error",
            "messages": [["execution_start", {}], ["execution_error", { "exception_message": "CUDA out of memory" }]]
        } } });
        assert_matches!(
            interpret_history(&failed, "abc"),
            HistoryState::Failed(detail) if detail.message == "CUDA out of memory"
        );

        let finished = json!({ "abc": { "outputs": {
            "9": { "images": [{ "filename": "still.png", "subfolder": "", "type": "output" }] },
            "12": { "gifs": [{ "filename": "clip.mp4", "subfolder": "vid", "type": "output" }] }
        } } });
        assert_matches!(
            interpret_history(&finished, "abc"),
            HistoryState::Finished(file) if file.filename == "clip.mp4" && file.subfolder == "vid"
        );
    }

    #[test]
    fn finished_without_media_is_output_validation() {
        let history = json!({ "abc": { "outputs": { "9": { "text": ["done"] } } } });
        assert_matches!(
            interpret_history(&history, "abc"),
            HistoryState::Failed(detail) if detail.code == Some(ErrorCode::OutputValidation)
        );
    }

    #[tokio::test]
    async fn initiate_rejects_unvetted_workflow_before_submitting() {
        // Nothing listens on the discard port; a submission would fail with
        // a connection error instead.
        let api = ComfyUIApi::with_client(reqwest::Client::new(), "http://127.0.0.1:9");
        let adapter = ComfyUIAdapter::from_api(
            api,
            WorkflowVetting::Production(crate::vetting::WorkflowAllowlist::default()),
        );
        let err = adapter
            .initiate("a red fox", &json!({ "workflow": workflow() }))
            .await
            .unwrap_err();
        assert_matches!(err, AdapterError::UnsupportedCapability(m) if m.contains("KSampler"));
    }

    #[test]
    fn view_url_is_encoded() {
        let api = ComfyUIApi::with_client(reqwest::Client::new(), "http://gpu:8188/");
        let url = api
            .view_url(&OutputFile {
                filename: "my clip.mp4".into(),
                subfolder: "a/b".into(),
                kind: "output".into(),
            })
            .unwrap();
        assert_eq!(
            url,
            "http://gpu:8188/view?filename=my+clip.mp4&subfolder=a%2Fb&type=output"
        );
    }
}
