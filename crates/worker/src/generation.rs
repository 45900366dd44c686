//! Generation worker.
//!
//! One worker slot consumes one generation task at a time: it drives the
//! segment through its backend, stores the artifact and records the
//! outcome. A delivery is acked only once the outcome is durable; store
//! or storage outages nack it so the task comes back.

use std::sync::Arc;
use std::time::Duration;

use foundry_adapters::{AdapterError, AdapterFactory, GenerationAdapter, PollStatus};
use foundry_core::config::EngineConfig;
use foundry_core::retry::BackoffPolicy;
use foundry_core::taxonomy::{classify_failure, ErrorCode};
use foundry_core::types::OutputRef;
use foundry_db::models::segment::{Segment, SegmentFailure};
use foundry_db::models::status::SegmentStatus;
use foundry_db::EntityStore;
use foundry_events::{Delivery, EventBus, GenerationTask, QueueTopic, RenderEventKind, Task, TaskQueue};
use foundry_storage::{segment_key, ObjectStore};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

/// Timing knobs of a worker slot.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_backoff: BackoffPolicy,
    /// Upper bound on initiate-to-terminal for one attempt.
    pub generation_timeout: Duration,
    /// Pause after a nack before taking the next task.
    pub nack_delay: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll_backoff: config.poll_backoff.clone(),
            generation_timeout: config.generation_timeout,
            nack_delay: config.poll_backoff.initial_delay,
        }
    }
}

/// What processing a task amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task no longer matches the segment and was dropped.
    Stale,
    /// The outcome was already recorded; its event was published again.
    Replayed,
    Completed(OutputRef),
    Failed(ErrorCode),
}

pub struct GenerationWorker {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<EventBus>,
    storage: Arc<dyn ObjectStore>,
    adapters: Arc<AdapterFactory>,
    settings: WorkerSettings,
}

impl GenerationWorker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
        bus: Arc<EventBus>,
        storage: Arc<dyn ObjectStore>,
        adapters: Arc<AdapterFactory>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            storage,
            adapters,
            settings,
        }
    }

    /// Consume generation tasks until cancelled.
    pub async fn run(&self, slot: usize, cancel: CancellationToken) {
        tracing::info!(slot, "Generation worker started");
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(slot, "Generation worker shutting down");
                    break;
                }
                delivery = self.queue.consume(QueueTopic::Generation) => delivery,
            };
            match delivery {
                Ok(delivery) => {
                    // An in-progress generation is abandoned on shutdown; the
                    // dropped delivery goes back to the queue.
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!(slot, "Generation worker shutting down mid-task");
                            break;
                        }
                        _ = self.handle(delivery) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "Failed to consume generation task");
                    tokio::time::sleep(self.settings.nack_delay).await;
                }
            }
        }
    }

    /// Process one delivery and settle it.
    pub async fn handle(&self, delivery: Delivery) {
        let Task::Generation(task) = delivery.task().clone() else {
            tracing::warn!("Non-generation task on the generation topic, dropping");
            delivery.ack();
            return;
        };
        if delivery.is_redelivery() {
            tracing::debug!(
                segment_id = task.segment_id,
                delivery_attempt = delivery.attempt(),
                "Generation task redelivered"
            );
        }

        match self.process(&task).await {
            Ok(outcome) => {
                tracing::debug!(segment_id = task.segment_id, ?outcome, "Generation task settled");
                delivery.ack();
            }
            Err(e) => {
                tracing::error!(
                    segment_id = task.segment_id,
                    error = %e,
                    "Generation outcome not recorded, task will be redelivered"
                );
                delivery.nack();
                tokio::time::sleep(self.settings.nack_delay).await;
            }
        }
    }

    /// Drive the task's segment to a recorded outcome.
    pub async fn process(&self, task: &GenerationTask) -> Result<TaskOutcome, WorkerError> {
        let segment = match self.store.get_segment(task.segment_id).await {
            Ok(segment) => segment,
            Err(e) if e.is_not_found() => {
                tracing::debug!(segment_id = task.segment_id, "Segment gone, dropping task");
                return Ok(TaskOutcome::Stale);
            }
            Err(e) => return Err(e.into()),
        };
        if segment.fingerprint != task.fingerprint || segment.status == SegmentStatus::Pending {
            tracing::debug!(
                segment_id = segment.id,
                status = ?segment.status,
                "Task superseded by an edit, dropping"
            );
            return Ok(TaskOutcome::Stale);
        }

        match segment.status {
            SegmentStatus::Completed => return self.replay_completed(&segment).await,
            SegmentStatus::Failed => {
                self.replay_failed(&segment);
                return Ok(TaskOutcome::Replayed);
            }
            _ => {}
        }

        if let Some(generation) = self
            .store
            .find_generation(segment.id, &segment.fingerprint)
            .await?
        {
            tracing::info!(segment_id = segment.id, "Generation already recorded, skipping backend");
            self.record(&segment, &generation.output_ref).await?;
            return Ok(TaskOutcome::Completed(generation.output_ref));
        }

        let segment = if segment.status == SegmentStatus::Queued {
            match self
                .store
                .start_segment(segment.id, &segment.fingerprint, segment.attempt)
                .await?
            {
                Some(started) => started,
                None => {
                    tracing::debug!(segment_id = segment.id, "Segment moved on before start");
                    return Ok(TaskOutcome::Stale);
                }
            }
        } else {
            tracing::info!(
                segment_id = segment.id,
                attempt = segment.attempt,
                "Resuming generation after redelivery"
            );
            segment
        };
        self.bus.publish(RenderEventKind::SegmentStarted {
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
            attempt: segment.attempt,
        });

        match self.generate(&segment).await? {
            Ok(bytes) => {
                let key = segment_key(segment.project_id, segment.id, &segment.fingerprint);
                let output_ref = self.storage.put(&key, bytes).await?;
                self.record(&segment, &output_ref).await?;
                Ok(TaskOutcome::Completed(output_ref))
            }
            Err(failure) => self.fail(&segment, failure).await,
        }
    }

    /// Run one attempt against the backend. The outer error is a store
    /// outage; the inner one is the segment's failure.
    async fn generate(
        &self,
        segment: &Segment,
    ) -> Result<Result<Vec<u8>, SegmentFailure>, WorkerError> {
        let resume = match (&segment.backend, &segment.external_job_id) {
            (Some(backend), Some(external_job_id)) => Some((backend, external_job_id)),
            _ => None,
        };

        let (adapter, external_job_id) = match resume {
            Some((backend, external_job_id)) => match self.adapters.resolve(backend) {
                Ok(adapter) => (adapter, external_job_id.clone()),
                Err(e) => return Ok(Err(adapter_failure(&e))),
            },
            None => {
                let adapter = match self.adapters.resolve_for(&segment.model_params) {
                    Ok(adapter) => adapter,
                    Err(e) => return Ok(Err(adapter_failure(&e))),
                };
                let external_job_id = match adapter
                    .initiate(&segment.prompt, &segment.model_params)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => return Ok(Err(adapter_failure(&e))),
                };
                tracing::info!(
                    segment_id = segment.id,
                    attempt = segment.attempt,
                    backend = %adapter.backend(),
                    %external_job_id,
                    "Generation submitted"
                );
                if !self
                    .store
                    .set_external_job(segment.id, segment.attempt, adapter.backend(), &external_job_id)
                    .await?
                {
                    tracing::debug!(segment_id = segment.id, "Attempt superseded after submission");
                }
                (adapter, external_job_id)
            }
        };

        let polling = self.await_artifact(adapter.as_ref(), segment, &external_job_id);
        match tokio::time::timeout(self.settings.generation_timeout, polling).await {
            Ok(result) => Ok(result),
            Err(_) => {
                tracing::warn!(
                    segment_id = segment.id,
                    %external_job_id,
                    timeout_secs = self.settings.generation_timeout.as_secs(),
                    "Generation timed out"
                );
                if let Err(e) = adapter.cancel(&external_job_id).await {
                    tracing::warn!(%external_job_id, error = %e, "Failed to cancel timed-out generation");
                }
                Ok(Err(SegmentFailure::new(
                    ErrorCode::Timeout,
                    format!(
                        "Generation exceeded {}s",
                        self.settings.generation_timeout.as_secs()
                    ),
                )))
            }
        }
    }

    /// Poll until the backend reports a terminal state, then fetch the
    /// artifact.
    async fn await_artifact(
        &self,
        adapter: &dyn GenerationAdapter,
        segment: &Segment,
        external_job_id: &str,
    ) -> Result<Vec<u8>, SegmentFailure> {
        let policy = &self.settings.poll_backoff;
        let mut delay = policy.initial_delay.min(policy.max_delay);
        loop {
            tokio::time::sleep(delay).await;
            delay = policy.next_delay(delay);

            match adapter.poll(external_job_id).await {
                Ok(PollStatus::Running) => {}
                Ok(PollStatus::Succeeded { artifact_ref }) => {
                    return fetch_artifact(adapter, &artifact_ref).await;
                }
                Ok(PollStatus::Failed { detail }) => {
                    let code = classify_failure(&detail);
                    tracing::warn!(
                        segment_id = segment.id,
                        %code,
                        reason = %detail.message,
                        "Backend reported failure"
                    );
                    return Err(SegmentFailure::new(code, detail.message));
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(segment_id = segment.id, error = %e, "Poll failed, retrying");
                }
                Err(e) => return Err(adapter_failure(&e)),
            }
        }
    }

    async fn record(&self, segment: &Segment, output_ref: &OutputRef) -> Result<(), WorkerError> {
        let record = self
            .store
            .record_generation(segment.id, &segment.fingerprint, output_ref)
            .await?;
        if record.completed_segment.is_none() {
            tracing::debug!(segment_id = segment.id, "Generation kept for an older fingerprint");
        }
        tracing::info!(segment_id = segment.id, output_ref = %output_ref, "Segment completed");
        self.bus.publish(RenderEventKind::SegmentCompleted {
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
            attempt: segment.attempt,
            output_ref: output_ref.clone(),
        });
        Ok(())
    }

    async fn fail(
        &self,
        segment: &Segment,
        failure: SegmentFailure,
    ) -> Result<TaskOutcome, WorkerError> {
        let code = failure.code;
        match self
            .store
            .fail_segment(segment.id, &segment.fingerprint, segment.attempt, &failure)
            .await?
        {
            Some(_) => {
                tracing::warn!(
                    segment_id = segment.id,
                    attempt = segment.attempt,
                    %code,
                    retryable = failure.retryable,
                    "Segment failed"
                );
                self.bus.publish(RenderEventKind::SegmentFailed {
                    segment_id: segment.id,
                    fingerprint: segment.fingerprint.clone(),
                    attempt: segment.attempt,
                    code,
                    retryable: failure.retryable,
                    message: failure.message,
                });
                Ok(TaskOutcome::Failed(code))
            }
            None => {
                tracing::debug!(segment_id = segment.id, "Failure for a superseded attempt discarded");
                Ok(TaskOutcome::Stale)
            }
        }
    }

    async fn replay_completed(&self, segment: &Segment) -> Result<TaskOutcome, WorkerError> {
        let output_ref = match &segment.output_ref {
            Some(output_ref) => output_ref.clone(),
            None => match self
                .store
                .find_generation(segment.id, &segment.fingerprint)
                .await?
            {
                Some(generation) => generation.output_ref,
                None => return Ok(TaskOutcome::Stale),
            },
        };
        self.bus.publish(RenderEventKind::SegmentCompleted {
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
            attempt: segment.attempt,
            output_ref,
        });
        Ok(TaskOutcome::Replayed)
    }

    fn replay_failed(&self, segment: &Segment) {
        let code = segment.failure_code().unwrap_or(ErrorCode::GenerationFailure);
        self.bus.publish(RenderEventKind::SegmentFailed {
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
            attempt: segment.attempt,
            code,
            retryable: segment.error_retryable.unwrap_or(code.is_retryable()),
            message: segment.error_message.clone().unwrap_or_default(),
        });
    }
}

async fn fetch_artifact(
    adapter: &dyn GenerationAdapter,
    artifact_ref: &str,
) -> Result<Vec<u8>, SegmentFailure> {
    match adapter.fetch_artifact(artifact_ref).await {
        Ok(bytes) if bytes.is_empty() => Err(SegmentFailure::new(
            ErrorCode::OutputValidation,
            "Backend returned an empty artifact",
        )),
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(SegmentFailure::new(
            ErrorCode::OutputValidation,
            format!("Artifact could not be fetched: {e}"),
        )),
    }
}

fn adapter_failure(err: &AdapterError) -> SegmentFailure {
    SegmentFailure {
        code: err.code(),
        message: err.to_string(),
        retryable: err.is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_adapters::{MockAdapter, MockOutcome};
    use foundry_core::config::ExecutionMode;
    use foundry_core::taxonomy::FailureDetail;
    use foundry_db::models::project::CreateProject;
    use foundry_db::models::segment::{CreateSegment, UpdateSegment};
    use foundry_db::MemoryStore;
    use foundry_events::MemoryQueue;
    use foundry_storage::MemoryObjectStore;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryStore>,
        storage: Arc<MemoryObjectStore>,
        mock: Arc<MockAdapter>,
        bus: Arc<EventBus>,
        worker: GenerationWorker,
    }

    fn harness(mock: MockAdapter) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(MemoryObjectStore::new());
        let mock = Arc::new(mock);
        let bus = Arc::new(EventBus::default());
        let mut factory = AdapterFactory::new(ExecutionMode::Developer);
        factory.register_mock(mock.clone());
        let worker = GenerationWorker::new(
            store.clone(),
            Arc::new(MemoryQueue::new()),
            bus.clone(),
            storage.clone(),
            Arc::new(factory),
            WorkerSettings {
                poll_backoff: BackoffPolicy {
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    multiplier: 2.0,
                },
                generation_timeout: Duration::from_millis(200),
                nack_delay: Duration::from_millis(1),
            },
        );
        Harness {
            store,
            storage,
            mock,
            bus,
            worker,
        }
    }

    /// A queued segment and the task that would have been published for it.
    async fn queued_segment(store: &MemoryStore, prompt: &str) -> (Segment, GenerationTask) {
        let project = store
            .create_project(&CreateProject { name: "p".into() })
            .await
            .unwrap();
        let segment = store
            .add_segment(project.id, &CreateSegment::new(prompt, json!({})))
            .await
            .unwrap();
        let segment = store
            .queue_segment(segment.id, &segment.fingerprint, &[SegmentStatus::Pending])
            .await
            .unwrap()
            .unwrap();
        let task = GenerationTask {
            project_id: project.id,
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
        };
        (segment, task)
    }

    #[tokio::test]
    async fn success_stores_artifact_and_completes_segment() {
        let h = harness(MockAdapter::new());
        let mut events = h.bus.subscribe();
        let (segment, task) = queued_segment(&h.store, "sunrise").await;

        let outcome = h.worker.process(&task).await.unwrap();
        let output_ref = assert_matches::assert_matches!(outcome, TaskOutcome::Completed(r) => r);

        let stored = h.store.get_segment(segment.id).await.unwrap();
        assert_eq!(stored.status, SegmentStatus::Completed);
        assert_eq!(stored.output_ref.as_deref(), Some(output_ref.as_str()));
        assert_eq!(stored.backend.as_deref(), Some("mock"));
        assert_eq!(
            h.storage.get(&output_ref).await.unwrap(),
            MockAdapter::artifact_bytes("sunrise")
        );
        assert!(output_ref.ends_with(&format!("{}.mp4", segment.fingerprint)));

        assert_matches::assert_matches!(
            events.recv().await.unwrap().kind,
            RenderEventKind::SegmentStarted { attempt: 1, .. }
        );
        assert_matches::assert_matches!(
            events.recv().await.unwrap().kind,
            RenderEventKind::SegmentCompleted { attempt: 1, .. }
        );
    }

    #[tokio::test]
    async fn backend_failure_is_classified() {
        let h = harness(MockAdapter::new());
        let (segment, task) = queued_segment(&h.store, "bad").await;
        h.mock.script(
            "bad",
            MockOutcome::Fail(FailureDetail::new("Invalid parameter: steps")),
        );

        let outcome = h.worker.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::InvalidParameters));
        let stored = h.store.get_segment(segment.id).await.unwrap();
        assert!(stored.is_dead_lettered());
    }

    #[tokio::test]
    async fn rejected_initiate_fails_without_polling() {
        let h = harness(MockAdapter::new());
        let (segment, task) = queued_segment(&h.store, "down").await;
        h.mock.script(
            "down",
            MockOutcome::RejectInitiate(AdapterError::Connection("refused".into())),
        );

        let outcome = h.worker.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::ConnectionError));
        assert!(h.store.get_segment(segment.id).await.unwrap().is_retryable_failure());
    }

    #[tokio::test]
    async fn unknown_backend_is_unsupported() {
        let h = harness(MockAdapter::new());
        let project = h
            .store
            .create_project(&CreateProject { name: "p".into() })
            .await
            .unwrap();
        let segment = h
            .store
            .add_segment(project.id, &CreateSegment::new("x", json!({ "model": "veo" })))
            .await
            .unwrap();
        h.store
            .queue_segment(segment.id, &segment.fingerprint, &[SegmentStatus::Pending])
            .await
            .unwrap();
        let task = GenerationTask {
            project_id: project.id,
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
        };

        let outcome = h.worker.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::UnsupportedCapability));
        assert_eq!(h.mock.initiated_count(), 0);
    }

    #[tokio::test]
    async fn empty_artifact_fails_output_validation() {
        let h = harness(MockAdapter::new());
        let (_, task) = queued_segment(&h.store, "blank").await;
        h.mock.script("blank", MockOutcome::EmptyArtifact);

        let outcome = h.worker.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::OutputValidation));
    }

    #[tokio::test]
    async fn hung_backend_times_out_and_is_cancelled() {
        let h = harness(MockAdapter::new().with_default_outcome(MockOutcome::Hang));
        let (segment, task) = queued_segment(&h.store, "stuck").await;

        let outcome = h.worker.process(&task).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed(ErrorCode::Timeout));
        let stored = h.store.get_segment(segment.id).await.unwrap();
        assert!(stored.is_retryable_failure());
        assert_eq!(h.mock.cancelled_jobs().len(), 1);
    }

    #[tokio::test]
    async fn edited_segment_task_is_dropped() {
        let h = harness(MockAdapter::new());
        let (segment, task) = queued_segment(&h.store, "old").await;
        h.store
            .update_segment(
                segment.id,
                &UpdateSegment {
                    prompt: Some("new".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(h.worker.process(&task).await.unwrap(), TaskOutcome::Stale);
        assert_eq!(h.mock.initiated_count(), 0);
    }

    #[tokio::test]
    async fn redelivery_after_completion_replays_event() {
        let h = harness(MockAdapter::new());
        let (_, task) = queued_segment(&h.store, "twice").await;
        h.worker.process(&task).await.unwrap();

        let mut events = h.bus.subscribe();
        assert_eq!(h.worker.process(&task).await.unwrap(), TaskOutcome::Replayed);
        assert_eq!(h.mock.initiated_count(), 1);
        assert_matches::assert_matches!(
            events.recv().await.unwrap().kind,
            RenderEventKind::SegmentCompleted { .. }
        );
    }

    #[tokio::test]
    async fn redelivery_mid_generation_resumes_external_job() {
        let h = harness(MockAdapter::new().with_polls(2));
        let (segment, task) = queued_segment(&h.store, "resume").await;
        h.store
            .start_segment(segment.id, &segment.fingerprint, segment.attempt)
            .await
            .unwrap();
        let external = h.mock.initiate("resume", &json!({})).await.unwrap();
        h.store
            .set_external_job(segment.id, segment.attempt, "mock", &external)
            .await
            .unwrap();

        let outcome = h.worker.process(&task).await.unwrap();
        assert_matches::assert_matches!(outcome, TaskOutcome::Completed(_));
        assert_eq!(h.mock.initiated_count(), 1);
    }
}
