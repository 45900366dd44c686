//! Postgres store tests. Need a database: `DATABASE_URL=... cargo test -- --ignored`.

use assert_matches::assert_matches;
use foundry_core::error::CoreError;
use foundry_core::taxonomy::ErrorCode;
use foundry_db::models::project::CreateProject;
use foundry_db::models::render_job::{CompletionOutcome, JobSegment};
use foundry_db::models::segment::{CreateSegment, SegmentFailure, UpdateSegment};
use foundry_db::models::status::{RenderJobStatus, SegmentStatus};
use foundry_db::{EntityStore, PgStore, StoreError};
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn bootstrap_seeds_lookup_tables(pool: PgPool) {
    foundry_db::health_check(&pool).await.unwrap();

    for (table, expected) in [("segment_statuses", 5), ("render_job_statuses", 7)] {
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("{table} query failed: {e}"));
        assert_eq!(count.0, expected, "{table}");
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn segment_lifecycle(pool: PgPool) {
    let store = PgStore::new(pool);
    let project = store
        .create_project(&CreateProject { name: "pg".into() })
        .await
        .unwrap();
    let a = store
        .add_segment(project.id, &CreateSegment::new("a", json!({"model": "mock"})))
        .await
        .unwrap();
    let b = store
        .add_segment(
            project.id,
            &CreateSegment {
                position: Some(0),
                ..CreateSegment::new("b", json!({}))
            },
        )
        .await
        .unwrap();
    assert_eq!(b.order_index, 0);
    assert_eq!(store.get_segment(a.id).await.unwrap().order_index, 1);

    let queued = store
        .queue_segment(a.id, &a.fingerprint, &[SegmentStatus::Pending])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queued.attempt, 1);
    store
        .start_segment(a.id, &a.fingerprint, 1)
        .await
        .unwrap()
        .unwrap();
    assert!(store
        .set_external_job(a.id, 1, "mock", "ext-1")
        .await
        .unwrap());

    let failed = store
        .fail_segment(
            a.id,
            &a.fingerprint,
            1,
            &SegmentFailure::new(ErrorCode::InvalidParameters, "bad steps"),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(failed.is_dead_lettered());

    let edit = store
        .update_segment(
            a.id,
            &UpdateSegment {
                prompt: Some("a2".into()),
                model_params: None,
            },
        )
        .await
        .unwrap();
    assert!(edit.changed);
    assert_eq!(edit.segment.status, SegmentStatus::Pending);
    assert!(edit.segment.error_code.is_none());

    let record = store
        .record_generation(a.id, &edit.segment.fingerprint, &"segments/a2".to_string())
        .await
        .unwrap();
    assert!(record.created);
    assert_eq!(
        record.completed_segment.map(|s| s.status),
        Some(SegmentStatus::Completed)
    );

    assert_matches!(
        store.get_segment(9_999).await,
        Err(StoreError::Core(CoreError::NotFound { .. }))
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn completion_dispatches_composition_once(pool: PgPool) {
    let store = PgStore::new(pool);
    let project = store
        .create_project(&CreateProject { name: "pg".into() })
        .await
        .unwrap();
    let seg = store
        .add_segment(project.id, &CreateSegment::new("a", json!({})))
        .await
        .unwrap();

    let job = store
        .create_render_job(
            project.id,
            &[JobSegment {
                segment_id: seg.id,
                order_index: 0,
                fingerprint: seg.fingerprint.clone(),
                completed: false,
            }],
        )
        .await
        .unwrap();
    store
        .transition_job(job.id, &[RenderJobStatus::Queued], RenderJobStatus::Dispatching)
        .await
        .unwrap()
        .unwrap();

    assert_matches!(
        store
            .record_segment_completion(job.id, seg.id, &seg.fingerprint)
            .await
            .unwrap(),
        CompletionOutcome::ReadyForComposition(j) if j.composition_dispatched
    );
    assert_matches!(
        store
            .record_segment_completion(job.id, seg.id, &seg.fingerprint)
            .await
            .unwrap(),
        CompletionOutcome::Unchanged
    );

    assert_matches!(
        store.remove_segment(seg.id).await,
        Err(StoreError::Core(CoreError::Conflict(_)))
    );

    let done = store
        .complete_job(job.id, &"renders/final.mp4".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, RenderJobStatus::Completed);
    assert_eq!(done.segments.len(), 1);
    assert!(store.fail_job(job.id, None, "late").await.unwrap().is_none());
}
