//! The entity store seam.
//!
//! [`EntityStore`] is the only shared mutable resource in the engine. Every
//! state change goes through one of its methods, and every method is atomic:
//! compare-and-set transitions return `None` (or
//! [`CompletionOutcome::Unchanged`]) when the precondition no longer holds
//! instead of overwriting a concurrent change.

use async_trait::async_trait;
use foundry_core::error::CoreError;
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, OutputRef};

use crate::models::generation::SegmentGeneration;
use crate::models::project::{CreateProject, Project};
use crate::models::render_job::{CompletionOutcome, JobSegment, RenderJob};
use crate::models::segment::{CreateSegment, Segment, SegmentEdit, SegmentFailure, UpdateSegment};
use crate::models::status::{RenderJobStatus, SegmentStatus};

/// Errors raised by an [`EntityStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: DbId) -> Self {
        Self::Core(CoreError::NotFound { entity, id })
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Core(CoreError::Conflict(message.into()))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Core(CoreError::Validation(message.into()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Core(CoreError::NotFound { .. }))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`EntityStore::record_generation`].
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub generation: SegmentGeneration,
    /// `false` when a generation for the same fingerprint already existed.
    pub created: bool,
    /// The segment, when this call moved it to `completed`.
    pub completed_segment: Option<Segment>,
}

/// Persistent state of projects, segments, generations and render jobs.
#[async_trait]
pub trait EntityStore: Send + Sync {
    // -- Projects --

    async fn create_project(&self, input: &CreateProject) -> StoreResult<Project>;

    async fn get_project(&self, id: DbId) -> StoreResult<Project>;

    /// Delete a project with its segments, generations and jobs.
    ///
    /// Rejected with `Conflict` while the project has an active render job.
    async fn delete_project(&self, id: DbId) -> StoreResult<()>;

    // -- Segment editing --

    /// Add a segment, shifting later segments when `position` is given.
    async fn add_segment(&self, project_id: DbId, input: &CreateSegment) -> StoreResult<Segment>;

    /// Edit prompt and/or model params.
    ///
    /// When the fingerprint changes the segment is reset to `pending` with
    /// its output and failure cleared, and active jobs still awaiting the
    /// old fingerprint are failed.
    async fn update_segment(&self, id: DbId, input: &UpdateSegment) -> StoreResult<SegmentEdit>;

    /// Remove a segment and close the gap in `order_index`.
    ///
    /// Rejected with `Conflict` while an active render job references it.
    async fn remove_segment(&self, id: DbId) -> StoreResult<()>;

    /// Reassign `order_index` from the position of each id in
    /// `ordered_ids`, which must list every segment of the project once.
    async fn reorder_segments(&self, project_id: DbId, ordered_ids: &[DbId])
        -> StoreResult<Vec<Segment>>;

    async fn get_segment(&self, id: DbId) -> StoreResult<Segment>;

    /// Segments of a project ordered by `order_index`.
    async fn list_segments(&self, project_id: DbId) -> StoreResult<Vec<Segment>>;

    // -- Segment transitions --

    /// CAS `from -> queued` for the given fingerprint, incrementing
    /// `attempt` and clearing failure and external-job fields.
    async fn queue_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        from: &[SegmentStatus],
    ) -> StoreResult<Option<Segment>>;

    /// CAS `queued -> generating` for the given attempt.
    async fn start_segment(&self, id: DbId, fingerprint: &str, attempt: i32)
        -> StoreResult<Option<Segment>>;

    /// Record the in-flight external job of the current attempt.
    async fn set_external_job(
        &self,
        id: DbId,
        attempt: i32,
        backend: &str,
        external_job_id: &str,
    ) -> StoreResult<bool>;

    /// CAS `queued | generating -> failed` for the given attempt.
    async fn fail_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
        failure: &SegmentFailure,
    ) -> StoreResult<Option<Segment>>;

    /// CAS `pending | failed -> completed` using an earlier generation of
    /// the segment's current fingerprint.
    async fn reuse_generation(&self, generation: &SegmentGeneration) -> StoreResult<Option<Segment>>;

    // -- Generations --

    async fn find_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<Option<SegmentGeneration>>;

    /// Idempotently record a successful generation.
    ///
    /// The generation is always kept. The segment moves to `completed` only
    /// if `fingerprint` is still its current one.
    async fn record_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        output_ref: &OutputRef,
    ) -> StoreResult<GenerationRecord>;

    // -- Render jobs --

    /// Create a `queued` job. `segments_completed` counts the snapshot
    /// entries already marked completed.
    async fn create_render_job(&self, project_id: DbId, snapshot: &[JobSegment])
        -> StoreResult<RenderJob>;

    async fn get_render_job(&self, id: DbId) -> StoreResult<RenderJob>;

    /// Jobs of a project, newest first.
    async fn list_render_jobs(&self, project_id: DbId) -> StoreResult<Vec<RenderJob>>;

    /// Every non-terminal job, oldest first.
    async fn list_active_render_jobs(&self) -> StoreResult<Vec<RenderJob>>;

    /// Non-terminal jobs whose snapshot has `(segment_id, fingerprint)`
    /// not yet completed.
    async fn jobs_awaiting(&self, segment_id: DbId, fingerprint: &str) -> StoreResult<Vec<RenderJob>>;

    /// Non-terminal jobs whose snapshot includes `segment_id`.
    async fn active_jobs_for_segment(&self, segment_id: DbId) -> StoreResult<Vec<RenderJob>>;

    /// CAS `from -> to`. Sets `completed_at` when `to` is terminal.
    async fn transition_job(
        &self,
        id: DbId,
        from: &[RenderJobStatus],
        to: RenderJobStatus,
    ) -> StoreResult<Option<RenderJob>>;

    /// CAS `from -> compositing` and set `composition_dispatched`, provided
    /// every snapshot entry is completed and composition was never
    /// dispatched for this job.
    async fn begin_composition(&self, id: DbId, from: &[RenderJobStatus])
        -> StoreResult<Option<RenderJob>>;

    /// Flip the snapshot entry `(segment_id, fingerprint)` and increment the
    /// counter; dispatch composition when it was the last one.
    async fn record_segment_completion(
        &self,
        job_id: DbId,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<CompletionOutcome>;

    /// CAS any non-terminal status `-> failed`.
    async fn fail_job(&self, id: DbId, code: Option<ErrorCode>, message: &str)
        -> StoreResult<Option<RenderJob>>;

    /// CAS `compositing -> completed` with the final artifact.
    async fn complete_job(&self, id: DbId, final_output_ref: &OutputRef)
        -> StoreResult<Option<RenderJob>>;
}
