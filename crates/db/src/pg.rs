//! Postgres [`EntityStore`] backend over the repository layer.

use std::collections::HashSet;

use async_trait::async_trait;
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, OutputRef};
use sqlx::PgPool;

use crate::models::generation::SegmentGeneration;
use crate::models::project::{CreateProject, Project};
use crate::models::render_job::{CompletionOutcome, JobSegment, RenderJob};
use crate::models::segment::{CreateSegment, Segment, SegmentEdit, SegmentFailure, UpdateSegment};
use crate::models::status::{RenderJobStatus, SegmentStatus};
use crate::repositories::project_repo::ProjectDelete;
use crate::repositories::segment_repo::SegmentDelete;
use crate::repositories::{GenerationRepo, ProjectRepo, RenderJobRepo, SegmentRepo};
use crate::store::{EntityStore, GenerationRecord, StoreError, StoreResult};

/// [`EntityStore`] persisted in Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn require_project(&self, id: DbId) -> StoreResult<()> {
        if ProjectRepo::exists(&self.pool, id).await? {
            Ok(())
        } else {
            Err(StoreError::not_found("project", id))
        }
    }

    /// Turn a missed CAS into `NotFound` when the row itself is gone.
    async fn segment_cas(&self, id: DbId, result: Option<Segment>) -> StoreResult<Option<Segment>> {
        if result.is_none() && SegmentRepo::find_by_id(&self.pool, id).await?.is_none() {
            return Err(StoreError::not_found("segment", id));
        }
        Ok(result)
    }

    async fn job_cas(&self, id: DbId, result: Option<RenderJob>) -> StoreResult<Option<RenderJob>> {
        if result.is_none() && RenderJobRepo::find_by_id(&self.pool, id).await?.is_none() {
            return Err(StoreError::not_found("render_job", id));
        }
        Ok(result)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn create_project(&self, input: &CreateProject) -> StoreResult<Project> {
        if input.name.trim().is_empty() {
            return Err(StoreError::validation("Project name must not be empty"));
        }
        Ok(ProjectRepo::create(&self.pool, input).await?)
    }

    async fn get_project(&self, id: DbId) -> StoreResult<Project> {
        ProjectRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::not_found("project", id))
    }

    async fn delete_project(&self, id: DbId) -> StoreResult<()> {
        match ProjectRepo::delete(&self.pool, id).await? {
            ProjectDelete::Deleted => Ok(()),
            ProjectDelete::NotFound => Err(StoreError::not_found("project", id)),
            ProjectDelete::ActiveJob => Err(StoreError::conflict(format!(
                "Project {id} has an active render job"
            ))),
        }
    }

    async fn add_segment(&self, project_id: DbId, input: &CreateSegment) -> StoreResult<Segment> {
        self.require_project(project_id).await?;
        Ok(SegmentRepo::insert(&self.pool, project_id, input).await?)
    }

    async fn update_segment(&self, id: DbId, input: &UpdateSegment) -> StoreResult<SegmentEdit> {
        let update = SegmentRepo::update_inputs(&self.pool, id, input)
            .await?
            .ok_or_else(|| StoreError::not_found("segment", id))?;
        if !update.superseded_jobs.is_empty() {
            tracing::info!(
                segment_id = id,
                jobs = ?update.superseded_jobs,
                "Segment edit superseded active render jobs"
            );
        }
        Ok(SegmentEdit {
            segment: update.segment,
            changed: update.changed,
            superseded_jobs: update.superseded_jobs,
        })
    }

    async fn remove_segment(&self, id: DbId) -> StoreResult<()> {
        match SegmentRepo::delete(&self.pool, id).await? {
            SegmentDelete::Deleted => Ok(()),
            SegmentDelete::NotFound => Err(StoreError::not_found("segment", id)),
            SegmentDelete::ActiveJob => Err(StoreError::conflict(format!(
                "Segment {id} is referenced by an active render job"
            ))),
        }
    }

    async fn reorder_segments(
        &self,
        project_id: DbId,
        ordered_ids: &[DbId],
    ) -> StoreResult<Vec<Segment>> {
        self.require_project(project_id).await?;
        let current: HashSet<DbId> = SegmentRepo::list_by_project(&self.pool, project_id)
            .await?
            .iter()
            .map(|s| s.id)
            .collect();
        let requested: HashSet<DbId> = ordered_ids.iter().copied().collect();
        if requested.len() != ordered_ids.len() || requested != current {
            return Err(StoreError::validation(
                "Reorder must list every segment of the project exactly once",
            ));
        }
        Ok(SegmentRepo::reorder(&self.pool, project_id, ordered_ids).await?)
    }

    async fn get_segment(&self, id: DbId) -> StoreResult<Segment> {
        SegmentRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::not_found("segment", id))
    }

    async fn list_segments(&self, project_id: DbId) -> StoreResult<Vec<Segment>> {
        self.require_project(project_id).await?;
        Ok(SegmentRepo::list_by_project(&self.pool, project_id).await?)
    }

    async fn queue_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        from: &[SegmentStatus],
    ) -> StoreResult<Option<Segment>> {
        let result = SegmentRepo::queue(&self.pool, id, fingerprint, from).await?;
        self.segment_cas(id, result).await
    }

    async fn start_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
    ) -> StoreResult<Option<Segment>> {
        let result = SegmentRepo::start(&self.pool, id, fingerprint, attempt).await?;
        self.segment_cas(id, result).await
    }

    async fn set_external_job(
        &self,
        id: DbId,
        attempt: i32,
        backend: &str,
        external_job_id: &str,
    ) -> StoreResult<bool> {
        Ok(SegmentRepo::set_external_job(&self.pool, id, attempt, backend, external_job_id).await?)
    }

    async fn fail_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
        failure: &SegmentFailure,
    ) -> StoreResult<Option<Segment>> {
        let result = SegmentRepo::fail(&self.pool, id, fingerprint, attempt, failure).await?;
        self.segment_cas(id, result).await
    }

    async fn reuse_generation(
        &self,
        generation: &SegmentGeneration,
    ) -> StoreResult<Option<Segment>> {
        let result = SegmentRepo::reuse(&self.pool, generation).await?;
        self.segment_cas(generation.segment_id, result).await
    }

    async fn find_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<Option<SegmentGeneration>> {
        Ok(GenerationRepo::find(&self.pool, segment_id, fingerprint).await?)
    }

    async fn record_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        output_ref: &OutputRef,
    ) -> StoreResult<GenerationRecord> {
        if SegmentRepo::find_by_id(&self.pool, segment_id).await?.is_none() {
            return Err(StoreError::not_found("segment", segment_id));
        }
        let recorded = GenerationRepo::record(&self.pool, segment_id, fingerprint, output_ref).await?;
        Ok(GenerationRecord {
            generation: recorded.generation,
            created: recorded.created,
            completed_segment: recorded.completed_segment,
        })
    }

    async fn create_render_job(
        &self,
        project_id: DbId,
        snapshot: &[JobSegment],
    ) -> StoreResult<RenderJob> {
        self.require_project(project_id).await?;
        Ok(RenderJobRepo::create(&self.pool, project_id, snapshot).await?)
    }

    async fn get_render_job(&self, id: DbId) -> StoreResult<RenderJob> {
        RenderJobRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| StoreError::not_found("render_job", id))
    }

    async fn list_render_jobs(&self, project_id: DbId) -> StoreResult<Vec<RenderJob>> {
        self.require_project(project_id).await?;
        Ok(RenderJobRepo::list_by_project(&self.pool, project_id).await?)
    }

    async fn list_active_render_jobs(&self) -> StoreResult<Vec<RenderJob>> {
        Ok(RenderJobRepo::list_active(&self.pool).await?)
    }

    async fn jobs_awaiting(
        &self,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<Vec<RenderJob>> {
        Ok(RenderJobRepo::list_awaiting(&self.pool, segment_id, fingerprint).await?)
    }

    async fn active_jobs_for_segment(&self, segment_id: DbId) -> StoreResult<Vec<RenderJob>> {
        Ok(RenderJobRepo::list_active_for_segment(&self.pool, segment_id).await?)
    }

    async fn transition_job(
        &self,
        id: DbId,
        from: &[RenderJobStatus],
        to: RenderJobStatus,
    ) -> StoreResult<Option<RenderJob>> {
        let allowed: Vec<RenderJobStatus> = from
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(to))
            .collect();
        if allowed.is_empty() {
            return Ok(None);
        }
        let result = RenderJobRepo::transition(&self.pool, id, &allowed, to).await?;
        self.job_cas(id, result).await
    }

    async fn begin_composition(
        &self,
        id: DbId,
        from: &[RenderJobStatus],
    ) -> StoreResult<Option<RenderJob>> {
        let allowed: Vec<RenderJobStatus> = from
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(RenderJobStatus::Compositing))
            .collect();
        if allowed.is_empty() {
            return Ok(None);
        }
        let result = RenderJobRepo::begin_composition(&self.pool, id, &allowed).await?;
        self.job_cas(id, result).await
    }

    async fn record_segment_completion(
        &self,
        job_id: DbId,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<CompletionOutcome> {
        RenderJobRepo::record_completion(&self.pool, job_id, segment_id, fingerprint)
            .await?
            .ok_or_else(|| StoreError::not_found("render_job", job_id))
    }

    async fn fail_job(
        &self,
        id: DbId,
        code: Option<ErrorCode>,
        message: &str,
    ) -> StoreResult<Option<RenderJob>> {
        let result = RenderJobRepo::fail(&self.pool, id, code, message).await?;
        self.job_cas(id, result).await
    }

    async fn complete_job(
        &self,
        id: DbId,
        final_output_ref: &OutputRef,
    ) -> StoreResult<Option<RenderJob>> {
        let result = RenderJobRepo::complete(&self.pool, id, final_output_ref).await?;
        self.job_cas(id, result).await
    }
}
