//! End-to-end render scenarios against the in-memory engine.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;
use common::{expected_video, FailingCompositor, FlakyObjectStore, Options, TestEngine};
use foundry_adapters::{AdapterError, MockAdapter, MockOutcome};
use foundry_core::config::{CompositorKind, EngineConfig, StorageBackendKind, StorageConfig};
use foundry_core::taxonomy::{ErrorCode, FailureDetail};
use foundry_db::models::project::CreateProject;
use foundry_db::models::segment::CreateSegment;
use foundry_db::models::status::{RenderJobStatus, SegmentStatus};
use foundry_db::EntityStore;
use foundry_pipeline::OrchestratorError;
use foundry_storage::ObjectStore;
use foundry_worker::Engine;
use serde_json::json;

#[tokio::test]
async fn new_project_renders_every_segment_and_composes() {
    let t = TestEngine::start().await;
    let (project_id, _) = t.project(&["dawn", "noon", "dusk"]).await;

    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();
    assert_eq!(t.generation_tasks_published(), 3);

    let job = t.wait_for_terminal(job.id).await;
    assert_eq!(job.status, RenderJobStatus::Completed);
    assert_eq!(job.segments_completed, 3);
    assert_eq!(t.final_bytes(&job).await, expected_video(&["dawn", "noon", "dusk"]));
    assert_eq!(t.mock.initiated_count(), 3);
    assert_eq!(t.composition_tasks_published(), 1);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn editing_one_segment_regenerates_only_that_segment() {
    let t = TestEngine::start().await;
    let (project_id, segments) = t.project(&["dawn", "noon", "dusk"]).await;
    let first = t.engine.orchestrator().start_render(project_id).await.unwrap();
    t.wait_for_terminal(first.id).await;
    let untouched_before = t.store.get_segment(segments[0].id).await.unwrap();

    t.edit_prompt(segments[1].id, "high noon").await;
    let second = t.engine.orchestrator().start_render(project_id).await.unwrap();
    assert_eq!(t.generation_tasks_published(), 4);
    assert_eq!(second.segments_completed, 2);

    let second = t.wait_for_terminal(second.id).await;
    assert_eq!(second.status, RenderJobStatus::Completed);
    assert_eq!(
        t.final_bytes(&second).await,
        expected_video(&["dawn", "high noon", "dusk"])
    );
    assert_eq!(t.mock.initiated_prompts().last().map(String::as_str), Some("high noon"));
    assert_eq!(t.mock.initiated_count(), 4);

    let untouched_after = t.store.get_segment(segments[0].id).await.unwrap();
    assert_eq!(untouched_after.output_ref, untouched_before.output_ref);
    assert_eq!(untouched_after.attempt, untouched_before.attempt);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn connection_error_is_retried_by_request() {
    let mock = MockAdapter::new();
    mock.script_sequence(
        "flaky",
        [
            MockOutcome::RejectInitiate(AdapterError::Connection("connection refused".into())),
            MockOutcome::Succeed,
        ],
    );
    let t = TestEngine::with(Options {
        mock,
        ..Default::default()
    })
    .await;
    let (project_id, segments) = t.project(&["steady", "flaky"]).await;
    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();

    let failed = t
        .wait_for_segment(segments[1].id, |s| s.status == SegmentStatus::Failed)
        .await;
    assert!(failed.is_retryable_failure());
    assert_eq!(failed.failure_code(), Some(ErrorCode::ConnectionError));
    assert!(!t.store.get_render_job(job.id).await.unwrap().is_terminal());

    // Retry at once, possibly before the failed delivery is acked.
    let retried = t.engine.orchestrator().retry_segment(segments[1].id).await.unwrap();
    assert_eq!(retried.attempt, 2);

    let job = t.wait_for_terminal(job.id).await;
    assert_eq!(job.status, RenderJobStatus::Completed);
    assert_eq!(t.final_bytes(&job).await, expected_video(&["steady", "flaky"]));

    t.engine.shutdown().await;
}

#[tokio::test]
async fn invalid_parameters_fail_the_job_until_edited() {
    let mock = MockAdapter::new();
    mock.script(
        "broken",
        MockOutcome::Fail(
            FailureDetail::new("Invalid value for steps").with_code(ErrorCode::InvalidParameters),
        ),
    );
    let t = TestEngine::with(Options {
        mock,
        ..Default::default()
    })
    .await;
    let (project_id, segments) = t.project(&["fine", "broken"]).await;
    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();

    let job = t.wait_for_terminal(job.id).await;
    assert_eq!(job.status, RenderJobStatus::Failed);
    assert_eq!(job.failure_code(), Some(ErrorCode::InvalidParameters));
    let segment = t.store.get_segment(segments[1].id).await.unwrap();
    assert!(segment.is_dead_lettered());

    assert_matches!(
        t.engine.orchestrator().retry_segment(segments[1].id).await,
        Err(OrchestratorError::NotRetryable(_))
    );
    assert_matches!(
        t.engine.orchestrator().start_render(project_id).await,
        Err(OrchestratorError::DeadLettered { code: ErrorCode::InvalidParameters, .. })
    );
    assert_eq!(
        t.store.get_render_job(job.id).await.unwrap().status,
        RenderJobStatus::Failed
    );

    t.edit_prompt(segments[1].id, "repaired").await;
    let next = t.engine.orchestrator().start_render(project_id).await.unwrap();
    let next = t.wait_for_terminal(next.id).await;
    assert_eq!(next.status, RenderJobStatus::Completed);
    assert_eq!(t.final_bytes(&next).await, expected_video(&["fine", "repaired"]));

    t.engine.shutdown().await;
}

#[tokio::test]
async fn composition_failure_is_retried_without_regenerating() {
    let t = TestEngine::with(Options {
        compositor: Arc::new(FailingCompositor::new(1)),
        ..Default::default()
    })
    .await;
    let (project_id, _) = t.project(&["one", "two", "three"]).await;
    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();

    let job = t.wait_for_terminal(job.id).await;
    assert_eq!(job.status, RenderJobStatus::Failed);
    assert_eq!(job.failure_code(), Some(ErrorCode::CompositionFailed));
    assert_eq!(job.segments_completed, 3);

    let retry = t.engine.orchestrator().start_render(project_id).await.unwrap();
    assert_eq!(retry.status, RenderJobStatus::Compositing);
    assert_eq!(t.generation_tasks_published(), 3);

    let retry = t.wait_for_terminal(retry.id).await;
    assert_eq!(retry.status, RenderJobStatus::Completed);
    assert_eq!(t.mock.initiated_count(), 3);
    assert_eq!(t.final_bytes(&retry).await, expected_video(&["one", "two", "three"]));

    t.engine.shutdown().await;
}

#[tokio::test]
async fn storage_outage_redelivers_until_recorded() {
    let storage = Arc::new(FlakyObjectStore::new(2));
    let t = TestEngine::with(Options {
        storage: storage.clone(),
        worker_pool_size: 1,
        ..Default::default()
    })
    .await;
    let (project_id, _) = t.project(&["only"]).await;
    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();

    let job = t.wait_for_terminal(job.id).await;
    assert_eq!(job.status, RenderJobStatus::Completed);
    assert_eq!(storage.failed_writes.load(Ordering::SeqCst), 2);
    // Redeliveries resumed the submitted backend job instead of starting over.
    assert_eq!(t.mock.initiated_count(), 1);
    assert_eq!(t.final_bytes(&job).await, expected_video(&["only"]));

    t.engine.shutdown().await;
}

#[tokio::test]
async fn cancel_stops_the_job_and_backend_work() {
    let t = TestEngine::with(Options {
        mock: MockAdapter::new().with_default_outcome(MockOutcome::Hang),
        ..Default::default()
    })
    .await;
    let (project_id, segments) = t.project(&["forever"]).await;
    let job = t.engine.orchestrator().start_render(project_id).await.unwrap();
    let generating = t
        .wait_for_segment(segments[0].id, |s| s.external_job_id.is_some())
        .await;

    let cancelled = t.engine.orchestrator().cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, RenderJobStatus::Cancelled);

    let external = generating.external_job_id.unwrap();
    common::wait_until(|| {
        let signalled = t.mock.cancelled_jobs().contains(&external);
        async move { signalled.then_some(()) }
    })
    .await;
    t.wait_for_segment(segments[0].id, |s| s.status == SegmentStatus::Failed)
        .await;
    assert_eq!(
        t.store.get_render_job(job.id).await.unwrap().status,
        RenderJobStatus::Cancelled
    );

    t.engine.shutdown().await;
}

#[tokio::test]
async fn engine_from_config_renders_to_local_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        worker_pool_size: 2,
        poll_backoff: common::fast_settings().poll_backoff,
        storage: StorageConfig {
            backend: StorageBackendKind::Local,
            local_path: dir.path().to_path_buf(),
            s3_bucket: None,
        },
        compositor: CompositorKind::Concat,
        ..Default::default()
    };
    let engine = Engine::from_config(&config).await.unwrap();
    assert_eq!(engine.worker_pool_size(), 2);
    assert_eq!(engine.storage().backend(), "local");

    let project = engine
        .store()
        .create_project(&CreateProject { name: "local".into() })
        .await
        .unwrap();
    for prompt in ["left", "right"] {
        engine
            .store()
            .add_segment(project.id, &CreateSegment::new(prompt, json!({})))
            .await
            .unwrap();
    }
    let job_id = engine.orchestrator().start_render(project.id).await.unwrap().id;
    let job = common::wait_until(|| {
        let store = engine.store().clone();
        async move {
            let job = store.get_render_job(job_id).await.unwrap();
            job.is_terminal().then_some(job)
        }
    })
    .await;
    assert_eq!(job.status, RenderJobStatus::Completed);

    let final_ref = job.final_output_ref.unwrap();
    let key = final_ref.strip_prefix("file://").unwrap();
    let on_disk = std::fs::read(dir.path().join(key)).unwrap();
    assert_eq!(on_disk, expected_video(&["left", "right"]));

    engine.shutdown().await;
}
