//! In-process [`EntityStore`] backend.
//!
//! All state lives behind one `RwLock`; every trait method takes the lock
//! once, so each call is atomic with respect to every other call. Used in
//! developer mode without `DATABASE_URL` and throughout the test suites.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use foundry_core::hashing::segment_fingerprint;
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, Fingerprint, OutputRef, Timestamp};
use tokio::sync::RwLock;

use crate::models::generation::SegmentGeneration;
use crate::models::project::{CreateProject, Project};
use crate::models::render_job::{CompletionOutcome, JobSegment, RenderJob};
use crate::models::segment::{CreateSegment, Segment, SegmentEdit, SegmentFailure, UpdateSegment};
use crate::models::status::{RenderJobStatus, SegmentStatus};
use crate::store::{EntityStore, GenerationRecord, StoreError, StoreResult};

#[derive(Default)]
struct State {
    last_id: DbId,
    projects: BTreeMap<DbId, Project>,
    segments: BTreeMap<DbId, Segment>,
    generations: HashMap<(DbId, Fingerprint), SegmentGeneration>,
    jobs: BTreeMap<DbId, RenderJob>,
}

impl State {
    fn next_id(&mut self) -> DbId {
        self.last_id += 1;
        self.last_id
    }

    fn project(&self, id: DbId) -> StoreResult<&Project> {
        self.projects
            .get(&id)
            .ok_or_else(|| StoreError::not_found("project", id))
    }

    fn segment(&self, id: DbId) -> StoreResult<&Segment> {
        self.segments
            .get(&id)
            .ok_or_else(|| StoreError::not_found("segment", id))
    }

    fn segment_mut(&mut self, id: DbId) -> StoreResult<&mut Segment> {
        self.segments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("segment", id))
    }

    fn job_mut(&mut self, id: DbId) -> StoreResult<&mut RenderJob> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("render_job", id))
    }

    fn project_segments(&self, project_id: DbId) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .segments
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.order_index);
        segments
    }

    /// Close gaps so the project's order indexes are `0..n-1` again.
    fn renumber(&mut self, project_id: DbId, now: Timestamp) {
        for (index, segment) in self.project_segments(project_id).into_iter().enumerate() {
            if let Some(s) = self.segments.get_mut(&segment.id) {
                if s.order_index != index as i32 {
                    s.order_index = index as i32;
                    s.updated_at = now;
                }
            }
        }
    }

    fn touch_project(&mut self, project_id: DbId, now: Timestamp) {
        if let Some(project) = self.projects.get_mut(&project_id) {
            project.updated_at = now;
        }
    }
}

fn clear_attempt_fields(segment: &mut Segment) {
    segment.error_code = None;
    segment.error_message = None;
    segment.error_retryable = None;
    segment.backend = None;
    segment.external_job_id = None;
}

fn fail(job: &mut RenderJob, code: Option<ErrorCode>, message: &str, now: Timestamp) {
    job.status = RenderJobStatus::Failed;
    job.error_code = code.map(|c| c.as_str().to_string());
    job.error_message = Some(message.to_string());
    job.updated_at = now;
    job.completed_at = Some(now);
}

/// [`EntityStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_project(&self, input: &CreateProject) -> StoreResult<Project> {
        if input.name.trim().is_empty() {
            return Err(StoreError::validation("Project name must not be empty"));
        }
        let mut state = self.state.write().await;
        let now = Utc::now();
        let project = Project {
            id: state.next_id(),
            name: input.name.clone(),
            created_at: now,
            updated_at: now,
        };
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: DbId) -> StoreResult<Project> {
        self.state.read().await.project(id).cloned()
    }

    async fn delete_project(&self, id: DbId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.project(id)?;
        if state
            .jobs
            .values()
            .any(|j| j.project_id == id && !j.is_terminal())
        {
            return Err(StoreError::conflict(format!(
                "Project {id} has an active render job"
            )));
        }

        let segment_ids: HashSet<DbId> = state
            .segments
            .values()
            .filter(|s| s.project_id == id)
            .map(|s| s.id)
            .collect();
        state.segments.retain(|sid, _| !segment_ids.contains(sid));
        state
            .generations
            .retain(|(sid, _), _| !segment_ids.contains(sid));
        state.jobs.retain(|_, j| j.project_id != id);
        state.projects.remove(&id);
        Ok(())
    }

    async fn add_segment(&self, project_id: DbId, input: &CreateSegment) -> StoreResult<Segment> {
        let mut state = self.state.write().await;
        state.project(project_id)?;
        let now = Utc::now();

        let count = state
            .segments
            .values()
            .filter(|s| s.project_id == project_id)
            .count() as i32;
        let position = input.position.map_or(count, |p| p.clamp(0, count));
        for segment in state.segments.values_mut() {
            if segment.project_id == project_id && segment.order_index >= position {
                segment.order_index += 1;
                segment.updated_at = now;
            }
        }

        let segment = Segment {
            id: state.next_id(),
            project_id,
            order_index: position,
            prompt: input.prompt.clone(),
            model_params: input.model_params.clone(),
            status: SegmentStatus::Pending,
            fingerprint: segment_fingerprint(&input.prompt, &input.model_params),
            output_ref: None,
            error_code: None,
            error_message: None,
            error_retryable: None,
            attempt: 0,
            backend: None,
            external_job_id: None,
            created_at: now,
            updated_at: now,
        };
        state.segments.insert(segment.id, segment.clone());
        state.touch_project(project_id, now);
        Ok(segment)
    }

    async fn update_segment(&self, id: DbId, input: &UpdateSegment) -> StoreResult<SegmentEdit> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let segment = state.segment_mut(id)?;
        let prompt = input.prompt.clone().unwrap_or_else(|| segment.prompt.clone());
        let model_params = input
            .model_params
            .clone()
            .unwrap_or_else(|| segment.model_params.clone());
        let fingerprint = segment_fingerprint(&prompt, &model_params);
        let old_fingerprint = std::mem::replace(&mut segment.fingerprint, fingerprint);
        let changed = segment.fingerprint != old_fingerprint;

        segment.prompt = prompt;
        segment.model_params = model_params;
        if changed {
            segment.status = SegmentStatus::Pending;
            segment.output_ref = None;
            clear_attempt_fields(segment);
        }
        segment.updated_at = now;
        let segment = segment.clone();

        let mut superseded_jobs = Vec::new();
        if changed {
            let message = format!("Segment {id} was edited during the render");
            for job in state.jobs.values_mut() {
                if job.awaits(id, &old_fingerprint) {
                    fail(job, None, &message, now);
                    superseded_jobs.push(job.id);
                }
            }
        }
        state.touch_project(segment.project_id, now);
        if !superseded_jobs.is_empty() {
            tracing::info!(
                segment_id = id,
                jobs = ?superseded_jobs,
                "Segment edit superseded active render jobs"
            );
        }

        Ok(SegmentEdit {
            segment,
            changed,
            superseded_jobs,
        })
    }

    async fn remove_segment(&self, id: DbId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let project_id = state.segment(id)?.project_id;
        if state
            .jobs
            .values()
            .any(|j| !j.is_terminal() && j.references(id))
        {
            return Err(StoreError::conflict(format!(
                "Segment {id} is referenced by an active render job"
            )));
        }

        let now = Utc::now();
        state.segments.remove(&id);
        state.generations.retain(|(sid, _), _| *sid != id);
        state.renumber(project_id, now);
        state.touch_project(project_id, now);
        Ok(())
    }

    async fn reorder_segments(
        &self,
        project_id: DbId,
        ordered_ids: &[DbId],
    ) -> StoreResult<Vec<Segment>> {
        let mut state = self.state.write().await;
        state.project(project_id)?;

        let current: HashSet<DbId> = state
            .project_segments(project_id)
            .iter()
            .map(|s| s.id)
            .collect();
        let requested: HashSet<DbId> = ordered_ids.iter().copied().collect();
        if requested.len() != ordered_ids.len() || requested != current {
            return Err(StoreError::validation(
                "Reorder must list every segment of the project exactly once",
            ));
        }

        let now = Utc::now();
        for (index, id) in ordered_ids.iter().enumerate() {
            let segment = state.segment_mut(*id)?;
            if segment.order_index != index as i32 {
                segment.order_index = index as i32;
                segment.updated_at = now;
            }
        }
        state.touch_project(project_id, now);
        Ok(state.project_segments(project_id))
    }

    async fn get_segment(&self, id: DbId) -> StoreResult<Segment> {
        self.state.read().await.segment(id).cloned()
    }

    async fn list_segments(&self, project_id: DbId) -> StoreResult<Vec<Segment>> {
        let state = self.state.read().await;
        state.project(project_id)?;
        Ok(state.project_segments(project_id))
    }

    async fn queue_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        from: &[SegmentStatus],
    ) -> StoreResult<Option<Segment>> {
        let mut state = self.state.write().await;
        let segment = state.segment_mut(id)?;
        if segment.fingerprint != fingerprint || !from.contains(&segment.status) {
            return Ok(None);
        }
        segment.status = SegmentStatus::Queued;
        segment.attempt += 1;
        segment.output_ref = None;
        clear_attempt_fields(segment);
        segment.updated_at = Utc::now();
        Ok(Some(segment.clone()))
    }

    async fn start_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
    ) -> StoreResult<Option<Segment>> {
        let mut state = self.state.write().await;
        let segment = state.segment_mut(id)?;
        if segment.fingerprint != fingerprint
            || segment.attempt != attempt
            || segment.status != SegmentStatus::Queued
        {
            return Ok(None);
        }
        segment.status = SegmentStatus::Generating;
        segment.updated_at = Utc::now();
        Ok(Some(segment.clone()))
    }

    async fn set_external_job(
        &self,
        id: DbId,
        attempt: i32,
        backend: &str,
        external_job_id: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let segment = state.segment_mut(id)?;
        if segment.attempt != attempt || segment.status != SegmentStatus::Generating {
            return Ok(false);
        }
        segment.backend = Some(backend.to_string());
        segment.external_job_id = Some(external_job_id.to_string());
        segment.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_segment(
        &self,
        id: DbId,
        fingerprint: &str,
        attempt: i32,
        failure: &SegmentFailure,
    ) -> StoreResult<Option<Segment>> {
        let mut state = self.state.write().await;
        let segment = state.segment_mut(id)?;
        if segment.fingerprint != fingerprint
            || segment.attempt != attempt
            || !segment.status.is_in_flight()
        {
            return Ok(None);
        }
        segment.status = SegmentStatus::Failed;
        segment.output_ref = None;
        segment.error_code = Some(failure.code.as_str().to_string());
        segment.error_message = Some(failure.message.clone());
        segment.error_retryable = Some(failure.retryable);
        segment.updated_at = Utc::now();
        Ok(Some(segment.clone()))
    }

    async fn reuse_generation(
        &self,
        generation: &SegmentGeneration,
    ) -> StoreResult<Option<Segment>> {
        let mut state = self.state.write().await;
        let segment = state.segment_mut(generation.segment_id)?;
        if segment.fingerprint != generation.fingerprint
            || !matches!(segment.status, SegmentStatus::Pending | SegmentStatus::Failed)
        {
            return Ok(None);
        }
        segment.status = SegmentStatus::Completed;
        segment.output_ref = Some(generation.output_ref.clone());
        clear_attempt_fields(segment);
        segment.updated_at = Utc::now();
        Ok(Some(segment.clone()))
    }

    async fn find_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<Option<SegmentGeneration>> {
        let state = self.state.read().await;
        Ok(state
            .generations
            .get(&(segment_id, fingerprint.to_string()))
            .cloned())
    }

    async fn record_generation(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        output_ref: &OutputRef,
    ) -> StoreResult<GenerationRecord> {
        let mut state = self.state.write().await;
        state.segment(segment_id)?;
        let now = Utc::now();

        let key = (segment_id, fingerprint.to_string());
        let existing = state.generations.get(&key).cloned();
        let (generation, created) = match existing {
            Some(existing) => (existing, false),
            None => {
                let generation = SegmentGeneration {
                    id: state.next_id(),
                    segment_id,
                    fingerprint: fingerprint.to_string(),
                    output_ref: output_ref.clone(),
                    created_at: now,
                };
                state.generations.insert(key, generation.clone());
                (generation, true)
            }
        };

        let segment = state.segment_mut(segment_id)?;
        let completed_segment = if segment.fingerprint == fingerprint
            && segment.status != SegmentStatus::Completed
        {
            segment.status = SegmentStatus::Completed;
            segment.output_ref = Some(generation.output_ref.clone());
            segment.error_code = None;
            segment.error_message = None;
            segment.error_retryable = None;
            segment.updated_at = now;
            Some(segment.clone())
        } else {
            None
        };

        Ok(GenerationRecord {
            generation,
            created,
            completed_segment,
        })
    }

    async fn create_render_job(
        &self,
        project_id: DbId,
        snapshot: &[JobSegment],
    ) -> StoreResult<RenderJob> {
        let mut state = self.state.write().await;
        state.project(project_id)?;
        let now = Utc::now();

        let mut segments = snapshot.to_vec();
        segments.sort_by_key(|s| s.order_index);
        let job = RenderJob {
            id: state.next_id(),
            project_id,
            status: RenderJobStatus::Queued,
            segments_total: segments.len() as i32,
            segments_completed: segments.iter().filter(|s| s.completed).count() as i32,
            composition_dispatched: false,
            error_code: None,
            error_message: None,
            final_output_ref: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            segments,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_render_job(&self, id: DbId) -> StoreResult<RenderJob> {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("render_job", id))
    }

    async fn list_render_jobs(&self, project_id: DbId) -> StoreResult<Vec<RenderJob>> {
        let state = self.state.read().await;
        state.project(project_id)?;
        Ok(state
            .jobs
            .values()
            .rev()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_active_render_jobs(&self) -> StoreResult<Vec<RenderJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect())
    }

    async fn jobs_awaiting(
        &self,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<Vec<RenderJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.awaits(segment_id, fingerprint))
            .cloned()
            .collect())
    }

    async fn active_jobs_for_segment(&self, segment_id: DbId) -> StoreResult<Vec<RenderJob>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| !j.is_terminal() && j.references(segment_id))
            .cloned()
            .collect())
    }

    async fn transition_job(
        &self,
        id: DbId,
        from: &[RenderJobStatus],
        to: RenderJobStatus,
    ) -> StoreResult<Option<RenderJob>> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !from.contains(&job.status) || !job.status.can_transition_to(to) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(Some(job.clone()))
    }

    async fn begin_composition(
        &self,
        id: DbId,
        from: &[RenderJobStatus],
    ) -> StoreResult<Option<RenderJob>> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !from.contains(&job.status)
            || !job.status.can_transition_to(RenderJobStatus::Compositing)
            || job.composition_dispatched
            || job.segments_completed != job.segments_total
        {
            return Ok(None);
        }
        job.status = RenderJobStatus::Compositing;
        job.composition_dispatched = true;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn record_segment_completion(
        &self,
        job_id: DbId,
        segment_id: DbId,
        fingerprint: &str,
    ) -> StoreResult<CompletionOutcome> {
        let mut state = self.state.write().await;
        let job = state.job_mut(job_id)?;
        if job.is_terminal() {
            return Ok(CompletionOutcome::Unchanged);
        }
        let Some(entry) = job
            .segments
            .iter_mut()
            .find(|s| s.segment_id == segment_id && s.fingerprint == fingerprint && !s.completed)
        else {
            return Ok(CompletionOutcome::Unchanged);
        };

        entry.completed = true;
        job.segments_completed = (job.segments_completed + 1).min(job.segments_total);
        job.updated_at = Utc::now();

        if job.segments_completed == job.segments_total
            && !job.composition_dispatched
            && job.status.can_transition_to(RenderJobStatus::Compositing)
        {
            job.status = RenderJobStatus::Compositing;
            job.composition_dispatched = true;
            return Ok(CompletionOutcome::ReadyForComposition(job.clone()));
        }
        Ok(CompletionOutcome::Progressed(job.clone()))
    }

    async fn fail_job(
        &self,
        id: DbId,
        code: Option<ErrorCode>,
        message: &str,
    ) -> StoreResult<Option<RenderJob>> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if !job.status.can_transition_to(RenderJobStatus::Failed) {
            return Ok(None);
        }
        fail(job, code, message, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: DbId,
        final_output_ref: &OutputRef,
    ) -> StoreResult<Option<RenderJob>> {
        let mut state = self.state.write().await;
        let job = state.job_mut(id)?;
        if job.status != RenderJobStatus::Compositing {
            return Ok(None);
        }
        let now = Utc::now();
        job.status = RenderJobStatus::Completed;
        job.final_output_ref = Some(final_output_ref.clone());
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(Some(job.clone()))
    }
}
