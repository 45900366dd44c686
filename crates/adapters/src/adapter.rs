use async_trait::async_trait;
use foundry_core::taxonomy::FailureDetail;

use crate::error::AdapterError;

/// Identifier the backend assigned to a submitted generation.
pub type ExternalJobId = String;

/// Result of one [`GenerationAdapter::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Running,
    /// Finished; fetch the artifact with [`GenerationAdapter::fetch_artifact`].
    Succeeded { artifact_ref: String },
    Failed { detail: FailureDetail },
}

/// Protocol translation for one external generation backend.
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    /// Registry name, e.g. `"comfyui"`.
    fn backend(&self) -> &str;

    /// Submit a generation and return the backend's job id.
    async fn initiate(
        &self,
        prompt: &str,
        model_params: &serde_json::Value,
    ) -> Result<ExternalJobId, AdapterError>;

    async fn poll(&self, external_job_id: &str) -> Result<PollStatus, AdapterError>;

    /// Best effort. Callers log errors and move on.
    async fn cancel(&self, external_job_id: &str) -> Result<(), AdapterError>;

    /// Download the artifact a successful poll pointed at.
    async fn fetch_artifact(&self, artifact_ref: &str) -> Result<Vec<u8>, AdapterError>;
}
