//! In-process adapter for developer mode and tests.
//!
//! Outcomes are scripted per prompt. A script is a sequence consumed one
//! entry per `initiate`; its last entry sticks, so a single-entry script
//! applies to every attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use foundry_core::taxonomy::FailureDetail;

use crate::adapter::{ExternalJobId, GenerationAdapter, PollStatus};
use crate::error::AdapterError;

const ARTIFACT_PREFIX: &str = "mock://";

/// What a mock generation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Complete after the configured number of polls.
    Succeed,
    /// Report a backend failure after the configured number of polls.
    Fail(FailureDetail),
    /// Raise this error from `initiate`.
    RejectInitiate(AdapterError),
    /// Complete, but produce a zero-byte artifact.
    EmptyArtifact,
    /// Never leave `Running`.
    Hang,
}

struct MockJob {
    prompt: String,
    outcome: MockOutcome,
    polls_remaining: u32,
    cancelled: bool,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockOutcome>>,
    jobs: HashMap<ExternalJobId, MockJob>,
    initiated: Vec<String>,
    cancelled: Vec<ExternalJobId>,
}

pub struct MockAdapter {
    name: String,
    polls_before_completion: u32,
    default_outcome: MockOutcome,
    state: Mutex<MockState>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Succeeds on the second poll for every prompt.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            polls_before_completion: 1,
            default_outcome: MockOutcome::Succeed,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of `Running` polls before the outcome is reported.
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls_before_completion = polls;
        self
    }

    /// Outcome for prompts without a script.
    pub fn with_default_outcome(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Apply `outcome` to every generation of `prompt`.
    pub fn script(&self, prompt: impl Into<String>, outcome: MockOutcome) {
        self.script_sequence(prompt, [outcome]);
    }

    /// Apply `outcomes` to successive generations of `prompt`.
    pub fn script_sequence(
        &self,
        prompt: impl Into<String>,
        outcomes: impl IntoIterator<Item = MockOutcome>,
    ) {
        self.lock()
            .scripts
            .insert(prompt.into(), outcomes.into_iter().collect());
    }

    /// Prompts passed to `initiate`, in call order.
    pub fn initiated_prompts(&self) -> Vec<String> {
        self.lock().initiated.clone()
    }

    pub fn initiated_count(&self) -> usize {
        self.lock().initiated.len()
    }

    pub fn cancelled_jobs(&self) -> Vec<ExternalJobId> {
        self.lock().cancelled.clone()
    }

    /// Bytes a successful generation of `prompt` produces.
    pub fn artifact_bytes(prompt: &str) -> Vec<u8> {
        format!("mock-video:{prompt}\n").into_bytes()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_outcome(state: &mut MockState, prompt: &str, default: &MockOutcome) -> MockOutcome {
    match state.scripts.get_mut(prompt) {
        Some(script) if script.len() > 1 => script.pop_front().unwrap_or_else(|| default.clone()),
        Some(script) => script.front().cloned().unwrap_or_else(|| default.clone()),
        None => default.clone(),
    }
}

#[async_trait]
impl GenerationAdapter for MockAdapter {
    fn backend(&self) -> &str {
        &self.name
    }

    async fn initiate(
        &self,
        prompt: &str,
        _model_params: &serde_json::Value,
    ) -> Result<ExternalJobId, AdapterError> {
        let mut state = self.lock();
        state.initiated.push(prompt.to_string());
        let outcome = next_outcome(&mut state, prompt, &self.default_outcome);
        if let MockOutcome::RejectInitiate(err) = outcome {
            return Err(err);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let external_job_id = format!("mock_job_{}", &id[..12]);
        state.jobs.insert(
            external_job_id.clone(),
            MockJob {
                prompt: prompt.to_string(),
                outcome,
                polls_remaining: self.polls_before_completion,
                cancelled: false,
            },
        );
        tracing::debug!(backend = %self.name, %external_job_id, "Mock generation started");
        Ok(external_job_id)
    }

    async fn poll(&self, external_job_id: &str) -> Result<PollStatus, AdapterError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(external_job_id) else {
            return Ok(PollStatus::Failed {
                detail: FailureDetail::new(format!("Job {external_job_id} not found")),
            });
        };

        if job.cancelled {
            return Ok(PollStatus::Failed {
                detail: FailureDetail::new("Cancelled by user"),
            });
        }
        if job.outcome == MockOutcome::Hang {
            return Ok(PollStatus::Running);
        }
        if job.polls_remaining > 0 {
            job.polls_remaining -= 1;
            return Ok(PollStatus::Running);
        }

        Ok(match &job.outcome {
            MockOutcome::Fail(detail) => PollStatus::Failed {
                detail: detail.clone(),
            },
            _ => PollStatus::Succeeded {
                artifact_ref: format!("{ARTIFACT_PREFIX}{external_job_id}"),
            },
        })
    }

    async fn cancel(&self, external_job_id: &str) -> Result<(), AdapterError> {
        let mut state = self.lock();
        match state.jobs.get_mut(external_job_id) {
            Some(job) => {
                job.cancelled = true;
                state.cancelled.push(external_job_id.to_string());
                Ok(())
            }
            None => Err(AdapterError::InvalidParameters(format!(
                "Job {external_job_id} not found"
            ))),
        }
    }

    async fn fetch_artifact(&self, artifact_ref: &str) -> Result<Vec<u8>, AdapterError> {
        let state = self.lock();
        let job = artifact_ref
            .strip_prefix(ARTIFACT_PREFIX)
            .and_then(|id| state.jobs.get(id))
            .ok_or_else(|| AdapterError::Output(format!("Unknown artifact '{artifact_ref}'")))?;
        match job.outcome {
            MockOutcome::EmptyArtifact => Ok(Vec::new()),
            _ => Ok(Self::artifact_bytes(&job.prompt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use foundry_core::taxonomy::ErrorCode;
    use serde_json::json;

    use super::*;

    async fn run_to_end(adapter: &MockAdapter, prompt: &str) -> PollStatus {
        let id = adapter.initiate(prompt, &json!({})).await.unwrap();
        loop {
            match adapter.poll(&id).await.unwrap() {
                PollStatus::Running => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn succeeds_after_configured_polls() {
        let adapter = MockAdapter::new().with_polls(3);
        let id = adapter.initiate("a cat", &json!({})).await.unwrap();
        for _ in 0..3 {
            assert_eq!(adapter.poll(&id).await.unwrap(), PollStatus::Running);
        }
        let artifact_ref = assert_matches!(
            adapter.poll(&id).await.unwrap(),
            PollStatus::Succeeded { artifact_ref } => artifact_ref
        );
        assert_eq!(
            adapter.fetch_artifact(&artifact_ref).await.unwrap(),
            MockAdapter::artifact_bytes("a cat")
        );
    }

    #[tokio::test]
    async fn scripted_sequence_then_sticky_last() {
        let adapter = MockAdapter::new().with_polls(0);
        adapter.script_sequence(
            "flaky",
            [
                MockOutcome::Fail(FailureDetail::new("GPU busy")),
                MockOutcome::Succeed,
            ],
        );

        assert_matches!(run_to_end(&adapter, "flaky").await, PollStatus::Failed { .. });
        assert_matches!(run_to_end(&adapter, "flaky").await, PollStatus::Succeeded { .. });
        assert_matches!(run_to_end(&adapter, "flaky").await, PollStatus::Succeeded { .. });
        assert_eq!(adapter.initiated_count(), 3);
    }

    #[tokio::test]
    async fn initiate_rejection_is_typed() {
        let adapter = MockAdapter::new();
        adapter.script(
            "bad",
            MockOutcome::RejectInitiate(AdapterError::InvalidParameters("width".into())),
        );
        let err = adapter.initiate("bad", &json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameters);
    }

    #[tokio::test]
    async fn cancel_fails_the_job() {
        let adapter = MockAdapter::new().with_default_outcome(MockOutcome::Hang);
        let id = adapter.initiate("slow", &json!({})).await.unwrap();
        assert_eq!(adapter.poll(&id).await.unwrap(), PollStatus::Running);

        adapter.cancel(&id).await.unwrap();
        assert_matches!(adapter.poll(&id).await.unwrap(), PollStatus::Failed { .. });
        assert_eq!(adapter.cancelled_jobs(), vec![id]);
    }

    #[tokio::test]
    async fn empty_artifact() {
        let adapter = MockAdapter::new().with_polls(0);
        adapter.script("blank", MockOutcome::EmptyArtifact);
        let artifact_ref = assert_matches!(
            run_to_end(&adapter, "blank").await,
            PollStatus::Succeeded { artifact_ref } => artifact_ref
        );
        assert!(adapter.fetch_artifact(&artifact_ref).await.unwrap().is_empty());
    }
}
