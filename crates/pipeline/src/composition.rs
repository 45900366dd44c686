//! Composition stage.
//!
//! A single consumer of composition tasks. Jobs are composed one at a
//! time: clips are read from storage in snapshot order, joined by the
//! configured [`Compositor`], written to `renders/{project_id}/{job_id}.mp4`
//! and reported back through [`Orchestrator::on_composition_result`].

use std::sync::Arc;
use std::time::Duration;

use foundry_core::types::OutputRef;
use foundry_db::models::render_job::RenderJob;
use foundry_db::models::status::RenderJobStatus;
use foundry_db::EntityStore;
use foundry_events::{CompositionTask, Delivery, QueueTopic, Task, TaskQueue};
use foundry_storage::{render_key, ObjectStore};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::compositor::Compositor;
use crate::error::{CompositionError, OrchestratorError};
use crate::orchestrator::Orchestrator;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct CompositionStage {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    storage: Arc<dyn ObjectStore>,
    compositor: Arc<dyn Compositor>,
    /// Pause after a consume error or a nack.
    retry_delay: Duration,
}

impl CompositionStage {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
        storage: Arc<dyn ObjectStore>,
        compositor: Arc<dyn Compositor>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            queue,
            storage,
            compositor,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Consume composition tasks until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(compositor = self.compositor.name(), "Composition stage started");
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Composition stage shutting down");
                    break;
                }
                delivery = self.queue.consume(QueueTopic::Composition) => delivery,
            };
            match delivery {
                Ok(delivery) => self.handle(delivery).await,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to consume composition task");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Process one delivery and settle it.
    pub async fn handle(&self, delivery: Delivery) {
        let Task::Composition(task) = delivery.task().clone() else {
            tracing::warn!("Non-composition task on the composition topic, dropping");
            delivery.ack();
            return;
        };
        match self.process(&task).await {
            Ok(()) => delivery.ack(),
            Err(e) => {
                tracing::error!(job_id = task.job_id, error = %e, "Composition task will be redelivered");
                delivery.nack();
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }

    /// Compose the job of `task` and report the result. Errors mean the
    /// outcome could not be recorded.
    pub async fn process(&self, task: &CompositionTask) -> Result<(), OrchestratorError> {
        let job = match self.store.get_render_job(task.job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                tracing::debug!(job_id = task.job_id, "Job gone, dropping composition task");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if job.status != RenderJobStatus::Compositing {
            tracing::debug!(job_id = job.id, status = ?job.status, "Job not compositing, skipping");
            return Ok(());
        }

        let result = match self.compose(&job).await {
            Err(CompositionError::Store(e)) => return Err(e.into()),
            other => other,
        };
        self.orchestrator.on_composition_result(job.id, result).await
    }

    async fn compose(&self, job: &RenderJob) -> Result<OutputRef, CompositionError> {
        let mut entries = job.segments.clone();
        entries.sort_by_key(|s| s.order_index);

        let mut output_refs = Vec::with_capacity(entries.len());
        for entry in &entries {
            let generation = self
                .store
                .find_generation(entry.segment_id, &entry.fingerprint)
                .await?
                .ok_or_else(|| CompositionError::MissingOutput {
                    segment_id: entry.segment_id,
                    fingerprint: entry.fingerprint.clone(),
                })?;
            output_refs.push(generation.output_ref);
        }
        let clips = try_join_all(output_refs.iter().map(|r| self.storage.get(r))).await?;

        tracing::info!(job_id = job.id, clips = clips.len(), "Composing render");
        let video = self.compositor.compose(clips).await?;
        let output_ref = self
            .storage
            .put(&render_key(job.project_id, job.id), video)
            .await?;
        Ok(output_ref)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use foundry_adapters::AdapterFactory;
    use foundry_core::config::ExecutionMode;
    use foundry_db::MemoryStore;
    use foundry_events::{EventBus, PublishOutcome, QueueError};
    use foundry_storage::MemoryObjectStore;

    use super::*;
    use crate::compositor::ConcatCompositor;

    #[derive(Default)]
    struct UnavailableQueue {
        consumes: AtomicUsize,
    }

    #[async_trait]
    impl TaskQueue for UnavailableQueue {
        async fn publish(
            &self,
            _topic: QueueTopic,
            _task: Task,
            _idempotency_key: &str,
        ) -> Result<PublishOutcome, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }

        async fn consume(&self, _topic: QueueTopic) -> Result<Delivery, QueueError> {
            self.consumes.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Unavailable("broker down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consume_errors_back_off_by_the_configured_delay() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(UnavailableQueue::default());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            queue.clone(),
            Arc::new(EventBus::default()),
            Arc::new(AdapterFactory::new(ExecutionMode::Developer)),
        ));
        let stage = CompositionStage::new(
            orchestrator,
            store,
            queue.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ConcatCompositor),
        )
        .with_retry_delay(Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { stage.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(queue.consumes.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
