#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foundry_adapters::{AdapterFactory, MockAdapter};
use foundry_core::config::ExecutionMode;
use foundry_core::retry::BackoffPolicy;
use foundry_core::types::{DbId, OutputRef};
use foundry_db::models::project::CreateProject;
use foundry_db::models::render_job::RenderJob;
use foundry_db::models::segment::{CreateSegment, Segment, UpdateSegment};
use foundry_db::{EntityStore, MemoryStore};
use foundry_events::MemoryQueue;
use foundry_pipeline::{CompositionError, Compositor, ConcatCompositor};
use foundry_storage::{MemoryObjectStore, ObjectStore, StorageError};
use foundry_worker::{Engine, EngineComponents, WorkerSettings};
use serde_json::json;

pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        poll_backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        },
        generation_timeout: Duration::from_secs(2),
        nack_delay: Duration::from_millis(5),
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub queue: MemoryQueue,
    pub mock: Arc<MockAdapter>,
}

pub struct Options {
    pub mock: MockAdapter,
    pub storage: Arc<dyn ObjectStore>,
    pub compositor: Arc<dyn Compositor>,
    pub worker_pool_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mock: MockAdapter::new(),
            storage: Arc::new(MemoryObjectStore::new()),
            compositor: Arc::new(ConcatCompositor),
            worker_pool_size: 3,
        }
    }
}

impl TestEngine {
    pub async fn start() -> Self {
        Self::with(Options::default()).await
    }

    pub async fn with(options: Options) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = MemoryQueue::new();
        let mock = Arc::new(options.mock);
        let mut adapters = AdapterFactory::new(ExecutionMode::Developer);
        adapters.register_mock(mock.clone());

        let engine = Engine::start(EngineComponents {
            store: store.clone(),
            queue: Arc::new(queue.clone()),
            bus: Arc::new(foundry_events::EventBus::default()),
            storage: options.storage,
            adapters: Arc::new(adapters),
            compositor: options.compositor,
            settings: fast_settings(),
            worker_pool_size: options.worker_pool_size,
        })
        .await
        .unwrap();

        Self {
            engine,
            store,
            queue,
            mock,
        }
    }

    pub async fn project(&self, prompts: &[&str]) -> (DbId, Vec<Segment>) {
        let project = self
            .store
            .create_project(&CreateProject {
                name: "short film".into(),
            })
            .await
            .unwrap();
        let mut segments = Vec::new();
        for prompt in prompts {
            segments.push(
                self.store
                    .add_segment(project.id, &CreateSegment::new(*prompt, json!({})))
                    .await
                    .unwrap(),
            );
        }
        (project.id, segments)
    }

    pub async fn edit_prompt(&self, segment_id: DbId, prompt: &str) {
        self.engine
            .orchestrator()
            .edit_segment(
                segment_id,
                &UpdateSegment {
                    prompt: Some(prompt.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: DbId) -> RenderJob {
        wait_until(move || async move {
            let job = self.store.get_render_job(job_id).await.unwrap();
            job.is_terminal().then_some(job)
        })
        .await
    }

    pub async fn wait_for_segment(
        &self,
        segment_id: DbId,
        done: impl Fn(&Segment) -> bool,
    ) -> Segment {
        let done = &done;
        wait_until(move || async move {
            let segment = self.store.get_segment(segment_id).await.unwrap();
            done(&segment).then_some(segment)
        })
        .await
    }

    /// Wait until no generation task is queued or running.
    pub async fn wait_for_idle_generation(&self) {
        wait_until(move || async move {
            let stats = self.queue.stats(foundry_events::QueueTopic::Generation);
            (stats.ready == 0 && stats.in_flight == 0).then_some(())
        })
        .await
    }

    pub fn generation_tasks_published(&self) -> u64 {
        self.queue
            .stats(foundry_events::QueueTopic::Generation)
            .published
    }

    pub fn composition_tasks_published(&self) -> u64 {
        self.queue
            .stats(foundry_events::QueueTopic::Composition)
            .published
    }

    pub async fn final_bytes(&self, job: &RenderJob) -> Vec<u8> {
        let output_ref = job.final_output_ref.clone().unwrap();
        self.engine.storage().get(&output_ref).await.unwrap()
    }
}

pub async fn wait_until<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {WAIT_LIMIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Expected composed output for prompts rendered by the mock backend.
pub fn expected_video(prompts: &[&str]) -> Vec<u8> {
    prompts
        .iter()
        .flat_map(|p| MockAdapter::artifact_bytes(p))
        .collect()
}

/// Object store whose first `failures` writes fail.
pub struct FlakyObjectStore {
    inner: MemoryObjectStore,
    remaining_failures: AtomicUsize,
    pub failed_writes: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            remaining_failures: AtomicUsize::new(failures),
            failed_writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<OutputRef, StorageError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend("bucket unavailable".into()));
        }
        self.inner.put(key, bytes).await
    }

    async fn get(&self, output_ref: &OutputRef) -> Result<Vec<u8>, StorageError> {
        self.inner.get(output_ref).await
    }
}

/// Compositor that fails its first `failures` calls.
pub struct FailingCompositor {
    remaining_failures: AtomicUsize,
}

impl FailingCompositor {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Compositor for FailingCompositor {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn compose(&self, clips: Vec<Vec<u8>>) -> Result<Vec<u8>, CompositionError> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CompositionError::FfmpegFailed {
                exit_code: Some(1),
                stderr: "Invalid data found when processing input".into(),
            });
        }
        Ok(clips.concat())
    }
}
