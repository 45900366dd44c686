//! Render orchestration.
//!
//! [`Orchestrator`] decides which segments of a project need generation,
//! dispatches generation tasks, folds segment events into render job
//! bookkeeping and dispatches composition exactly once per job. Every
//! shared-state change goes through an atomic [`EntityStore`] operation, so
//! duplicated or reordered events are harmless.

use std::sync::Arc;

use foundry_adapters::AdapterFactory;
use foundry_core::taxonomy::ErrorCode;
use foundry_core::types::{DbId, OutputRef};
use foundry_db::models::render_job::{CompletionOutcome, JobSegment, RenderJob};
use foundry_db::models::segment::{Segment, SegmentEdit, UpdateSegment};
use foundry_db::models::status::{RenderJobStatus, SegmentStatus, ACTIVE_JOB_STATUSES};
use foundry_db::EntityStore;
use foundry_events::{
    CompositionTask, EventBus, GenerationTask, QueueTopic, RenderEvent, RenderEventKind, Task,
    TaskQueue, TopicReceiver,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{CompositionError, OrchestratorError};

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Progress snapshot of one render job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub job_id: DbId,
    pub status: RenderJobStatus,
    pub segments_completed: i32,
    pub segments_total: i32,
    pub percent: f64,
}

/// What one [`Orchestrator::reconcile`] pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub jobs_checked: usize,
    /// Snapshot entries flipped from a recorded generation.
    pub segments_recovered: usize,
    /// Generation tasks (re)published for pending or in-flight segments.
    pub tasks_republished: usize,
    /// Composition tasks (re)published.
    pub compositions_dispatched: usize,
    pub jobs_failed: usize,
}

pub struct Orchestrator {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<EventBus>,
    adapters: Arc<AdapterFactory>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn TaskQueue>,
        bus: Arc<EventBus>,
        adapters: Arc<AdapterFactory>,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            adapters,
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Create a render job for the project and dispatch its dirty segments.
    ///
    /// Returns as soon as the job exists and its tasks are queued. A project
    /// whose segments all have recorded outputs goes straight to
    /// `compositing`.
    pub async fn start_render(&self, project_id: DbId) -> OrchestratorResult<RenderJob> {
        self.store.get_project(project_id).await?;
        let segments = self.store.list_segments(project_id).await?;
        if segments.is_empty() {
            return Err(OrchestratorError::EmptyProject(project_id));
        }

        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        for segment in segments {
            match self
                .store
                .find_generation(segment.id, &segment.fingerprint)
                .await?
            {
                Some(generation) => clean.push((segment, generation)),
                None if segment.is_dead_lettered() => {
                    return Err(OrchestratorError::DeadLettered {
                        segment_id: segment.id,
                        code: segment
                            .failure_code()
                            .unwrap_or(ErrorCode::GenerationFailure),
                    });
                }
                None => dirty.push(segment),
            }
        }

        let mut snapshot = Vec::with_capacity(clean.len() + dirty.len());
        for (segment, generation) in &clean {
            if segment.status != SegmentStatus::Completed {
                self.store.reuse_generation(generation).await?;
                tracing::debug!(
                    segment_id = segment.id,
                    "Reusing recorded generation for unchanged inputs"
                );
            }
            snapshot.push(snapshot_entry(segment, true));
        }
        snapshot.extend(dirty.iter().map(|s| snapshot_entry(s, false)));

        let job = self.store.create_render_job(project_id, &snapshot).await?;
        tracing::info!(
            job_id = job.id,
            project_id,
            segments_total = job.segments_total,
            dirty = dirty.len(),
            "Render job created"
        );
        self.bus.publish(RenderEventKind::JobCreated {
            job_id: job.id,
            project_id,
            segments_total: job.segments_total,
            segments_dispatched: dirty.len(),
        });

        if dirty.is_empty() {
            if let Some(job) = self
                .store
                .begin_composition(job.id, &[RenderJobStatus::Queued])
                .await?
            {
                self.dispatch_composition(&job).await?;
            }
            return Ok(self.store.get_render_job(job.id).await?);
        }

        self.store
            .transition_job(job.id, &[RenderJobStatus::Queued], RenderJobStatus::Dispatching)
            .await?;
        for segment in &dirty {
            self.dispatch_segment(segment).await?;
        }

        // Outputs recorded between the dirty check and job creation never
        // reach this job through events.
        self.settle_recorded(job.id).await?;

        Ok(self.store.get_render_job(job.id).await?)
    }

    /// Re-queue a segment that failed with a retryable error.
    pub async fn retry_segment(&self, segment_id: DbId) -> OrchestratorResult<Segment> {
        let segment = self.store.get_segment(segment_id).await?;
        if !segment.is_retryable_failure() {
            return Err(OrchestratorError::NotRetryable(segment_id));
        }

        let queued = self
            .store
            .queue_segment(segment_id, &segment.fingerprint, &[SegmentStatus::Failed])
            .await?
            .ok_or(OrchestratorError::NotRetryable(segment_id))?;
        tracing::info!(segment_id, attempt = queued.attempt, "Retrying segment");
        self.publish_generation(&queued).await?;
        Ok(queued)
    }

    /// Cancel a render job. No-op on terminal jobs.
    ///
    /// Segments still generating only for this job get a best-effort
    /// cancel sent to their backend in the background. Their results are
    /// still recorded if they arrive.
    pub async fn cancel(&self, job_id: DbId) -> OrchestratorResult<RenderJob> {
        let job = self.store.get_render_job(job_id).await?;
        if job.is_terminal() {
            return Ok(job);
        }

        let Some(cancelled) = self
            .store
            .transition_job(job_id, &ACTIVE_JOB_STATUSES, RenderJobStatus::Cancelled)
            .await?
        else {
            return Ok(self.store.get_render_job(job_id).await?);
        };
        tracing::info!(job_id, "Render job cancelled");
        self.bus.publish(RenderEventKind::JobCancelled { job_id });

        for entry in cancelled.segments.iter().filter(|s| !s.completed) {
            let segment = match self.store.get_segment(entry.segment_id).await {
                Ok(segment) => segment,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if !segment.status.is_in_flight() || segment.fingerprint != entry.fingerprint {
                continue;
            }
            if !self
                .store
                .jobs_awaiting(segment.id, &segment.fingerprint)
                .await?
                .is_empty()
            {
                continue;
            }
            self.cancel_external(&segment);
        }

        Ok(cancelled)
    }

    /// Edit a segment's prompt or model params, failing active jobs that
    /// were still waiting for the old inputs.
    pub async fn edit_segment(
        &self,
        segment_id: DbId,
        input: &UpdateSegment,
    ) -> OrchestratorResult<SegmentEdit> {
        let edit = self.store.update_segment(segment_id, input).await?;
        for &job_id in &edit.superseded_jobs {
            let job = self.store.get_render_job(job_id).await?;
            self.bus.publish(RenderEventKind::JobFailed {
                job_id,
                code: job.failure_code(),
                message: job.error_message.unwrap_or_default(),
            });
        }
        Ok(edit)
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    /// Fold one segment event into segment and job state. Job events and
    /// stale segment events are ignored.
    pub async fn on_segment_event(&self, event: &RenderEvent) -> OrchestratorResult<()> {
        match &event.kind {
            RenderEventKind::SegmentStarted {
                segment_id,
                fingerprint,
                attempt,
            } => self.on_started(*segment_id, fingerprint, *attempt).await,
            RenderEventKind::SegmentCompleted {
                segment_id,
                fingerprint,
                output_ref,
                ..
            } => self.on_completed(*segment_id, fingerprint, output_ref).await,
            RenderEventKind::SegmentFailed {
                segment_id,
                fingerprint,
                attempt,
                code,
                retryable,
                message,
            } => {
                self.on_failed(*segment_id, fingerprint, *attempt, *code, *retryable, message)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn on_started(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        attempt: i32,
    ) -> OrchestratorResult<()> {
        let segment = match self
            .store
            .start_segment(segment_id, fingerprint, attempt)
            .await?
        {
            Some(segment) => segment,
            None => self.store.get_segment(segment_id).await?,
        };
        if segment.status != SegmentStatus::Generating
            || segment.attempt != attempt
            || segment.fingerprint != fingerprint
        {
            tracing::debug!(segment_id, attempt, "Ignoring stale start event");
            return Ok(());
        }

        for job in self.store.jobs_awaiting(segment_id, fingerprint).await? {
            self.store
                .transition_job(
                    job.id,
                    &[RenderJobStatus::Dispatching],
                    RenderJobStatus::Processing,
                )
                .await?;
        }
        Ok(())
    }

    async fn on_completed(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        output_ref: &OutputRef,
    ) -> OrchestratorResult<()> {
        let record = self
            .store
            .record_generation(segment_id, fingerprint, output_ref)
            .await?;
        if record.created {
            tracing::debug!(segment_id, "Generation recorded from event");
        }

        for job in self.store.jobs_awaiting(segment_id, fingerprint).await? {
            self.record_completion(job.id, segment_id, fingerprint).await?;
        }
        Ok(())
    }

    async fn on_failed(
        &self,
        segment_id: DbId,
        fingerprint: &str,
        attempt: i32,
        code: ErrorCode,
        retryable: bool,
        message: &str,
    ) -> OrchestratorResult<()> {
        let failure = foundry_db::models::segment::SegmentFailure {
            code,
            message: message.to_string(),
            retryable,
        };
        let segment = match self
            .store
            .fail_segment(segment_id, fingerprint, attempt, &failure)
            .await?
        {
            Some(segment) => segment,
            None => self.store.get_segment(segment_id).await?,
        };
        if segment.status != SegmentStatus::Failed
            || segment.attempt != attempt
            || segment.fingerprint != fingerprint
        {
            tracing::debug!(segment_id, attempt, "Ignoring stale failure event");
            return Ok(());
        }
        if retryable {
            tracing::info!(segment_id, attempt, %code, "Segment failed, awaiting retry");
            return Ok(());
        }

        for job in self.store.jobs_awaiting(segment_id, fingerprint).await? {
            self.fail_job(job.id, code, &format!("Segment {segment_id} failed: {message}"))
                .await?;
        }
        Ok(())
    }

    /// Report the outcome of a composition task.
    pub async fn on_composition_result(
        &self,
        job_id: DbId,
        result: Result<OutputRef, CompositionError>,
    ) -> OrchestratorResult<()> {
        match result {
            Ok(final_output_ref) => {
                match self.store.complete_job(job_id, &final_output_ref).await? {
                    Some(_) => {
                        tracing::info!(job_id, output_ref = %final_output_ref, "Render job completed");
                        self.bus.publish(RenderEventKind::JobCompleted {
                            job_id,
                            final_output_ref,
                        });
                    }
                    None => {
                        tracing::info!(job_id, "Composition finished for a job no longer compositing");
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Composition failed");
                self.fail_job(job_id, ErrorCode::CompositionFailed, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// Re-derive the bookkeeping of every active job from durable state.
    ///
    /// Flips snapshot entries whose generation is recorded, fails jobs
    /// blocked on a dead-lettered segment, re-publishes generation tasks
    /// for pending or in-flight segments and composition tasks for jobs in
    /// `compositing`. Publishing is idempotent per key, so running this
    /// while work is in flight is safe.
    pub async fn reconcile(&self) -> OrchestratorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for job in self.store.list_active_render_jobs().await? {
            report.jobs_checked += 1;
            if job.status == RenderJobStatus::Compositing {
                self.publish_composition(&job).await?;
                report.compositions_dispatched += 1;
                continue;
            }
            self.reconcile_job(&job, &mut report).await?;
        }
        tracing::info!(
            jobs_checked = report.jobs_checked,
            segments_recovered = report.segments_recovered,
            tasks_republished = report.tasks_republished,
            compositions_dispatched = report.compositions_dispatched,
            jobs_failed = report.jobs_failed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_job(
        &self,
        job: &RenderJob,
        report: &mut ReconcileReport,
    ) -> OrchestratorResult<()> {
        for entry in job.segments.iter().filter(|s| !s.completed) {
            if self
                .store
                .find_generation(entry.segment_id, &entry.fingerprint)
                .await?
                .is_some()
            {
                report.segments_recovered += 1;
                if self
                    .record_completion(job.id, entry.segment_id, &entry.fingerprint)
                    .await?
                {
                    report.compositions_dispatched += 1;
                }
                continue;
            }

            let segment = self.store.get_segment(entry.segment_id).await?;
            if segment.fingerprint != entry.fingerprint {
                continue;
            }
            if segment.is_dead_lettered() {
                let code = segment
                    .failure_code()
                    .unwrap_or(ErrorCode::GenerationFailure);
                let message = format!(
                    "Segment {} failed: {}",
                    segment.id,
                    segment.error_message.as_deref().unwrap_or("non-retryable error")
                );
                if self.fail_job(job.id, code, &message).await? {
                    report.jobs_failed += 1;
                }
                return Ok(());
            }
            match segment.status {
                SegmentStatus::Pending => {
                    self.dispatch_segment(&segment).await?;
                    report.tasks_republished += 1;
                }
                SegmentStatus::Queued | SegmentStatus::Generating => {
                    self.publish_generation(&segment).await?;
                    report.tasks_republished += 1;
                }
                SegmentStatus::Completed | SegmentStatus::Failed => {}
            }
        }

        if job.status == RenderJobStatus::Queued {
            self.store
                .transition_job(job.id, &[RenderJobStatus::Queued], RenderJobStatus::Dispatching)
                .await?;
        }
        if let Some(job) = self
            .store
            .begin_composition(job.id, &ACTIVE_JOB_STATUSES)
            .await?
        {
            self.dispatch_composition(&job).await?;
            report.compositions_dispatched += 1;
        }
        Ok(())
    }

    /// Consume segment events until cancelled or the bus closes. A lagged
    /// subscription triggers [`reconcile`](Self::reconcile).
    pub async fn run(&self, mut events: TopicReceiver, cancel: CancellationToken) {
        tracing::info!("Orchestrator event loop started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Orchestrator event loop shutting down");
                    break;
                }
                received = events.recv() => received,
            };
            match received {
                Ok(event) => {
                    if let Err(e) = self.on_segment_event(&event).await {
                        tracing::error!(
                            error = %e,
                            event_type = event.event_type(),
                            "Failed to apply segment event"
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Orchestrator lagged, reconciling from the store");
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "Reconciliation failed");
                    }
                }
                Err(RecvError::Closed) => {
                    tracing::info!("Event bus closed, orchestrator shutting down");
                    break;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, job_id: DbId) -> OrchestratorResult<RenderJob> {
        Ok(self.store.get_render_job(job_id).await?)
    }

    /// Jobs of a project, newest first.
    pub async fn list_jobs(&self, project_id: DbId) -> OrchestratorResult<Vec<RenderJob>> {
        Ok(self.store.list_render_jobs(project_id).await?)
    }

    pub async fn job_progress(&self, job_id: DbId) -> OrchestratorResult<JobProgress> {
        let job = self.store.get_render_job(job_id).await?;
        Ok(JobProgress {
            job_id,
            status: job.status,
            segments_completed: job.segments_completed,
            segments_total: job.segments_total,
            percent: job.progress_percent(),
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Move a pending or retryably failed segment to `queued` and publish
    /// its task. Segments already in flight only get their task
    /// re-published.
    async fn dispatch_segment(&self, segment: &Segment) -> OrchestratorResult<()> {
        if segment.status.is_in_flight() {
            return self.publish_generation(segment).await;
        }
        match self
            .store
            .queue_segment(
                segment.id,
                &segment.fingerprint,
                &[SegmentStatus::Pending, SegmentStatus::Failed],
            )
            .await?
        {
            Some(queued) => self.publish_generation(&queued).await,
            None => {
                let current = self.store.get_segment(segment.id).await?;
                if current.status.is_in_flight() && current.fingerprint == segment.fingerprint {
                    self.publish_generation(&current).await
                } else {
                    tracing::debug!(
                        segment_id = segment.id,
                        status = ?current.status,
                        "Segment changed before dispatch"
                    );
                    Ok(())
                }
            }
        }
    }

    async fn publish_generation(&self, segment: &Segment) -> OrchestratorResult<()> {
        let task = GenerationTask {
            project_id: segment.project_id,
            segment_id: segment.id,
            fingerprint: segment.fingerprint.clone(),
        };
        let key = task.idempotency_key();
        let outcome = self
            .queue
            .publish(QueueTopic::Generation, Task::Generation(task), &key)
            .await?;
        tracing::debug!(segment_id = segment.id, %key, ?outcome, "Generation task published");

        if segment.status == SegmentStatus::Queued {
            self.bus.publish(RenderEventKind::SegmentQueued {
                segment_id: segment.id,
                fingerprint: segment.fingerprint.clone(),
                attempt: segment.attempt,
            });
        }
        Ok(())
    }

    async fn dispatch_composition(&self, job: &RenderJob) -> OrchestratorResult<()> {
        tracing::info!(job_id = job.id, "All segments ready, dispatching composition");
        self.bus
            .publish(RenderEventKind::JobCompositing { job_id: job.id });
        self.publish_composition(job).await
    }

    async fn publish_composition(&self, job: &RenderJob) -> OrchestratorResult<()> {
        let task = CompositionTask {
            project_id: job.project_id,
            job_id: job.id,
        };
        let key = task.idempotency_key();
        self.queue
            .publish(QueueTopic::Composition, Task::Composition(task), &key)
            .await?;
        Ok(())
    }

    /// Flip one snapshot entry. Returns whether this call dispatched
    /// composition.
    async fn record_completion(
        &self,
        job_id: DbId,
        segment_id: DbId,
        fingerprint: &str,
    ) -> OrchestratorResult<bool> {
        match self
            .store
            .record_segment_completion(job_id, segment_id, fingerprint)
            .await?
        {
            CompletionOutcome::Unchanged => Ok(false),
            CompletionOutcome::Progressed(job) => {
                self.bus.publish(RenderEventKind::JobProgress {
                    job_id,
                    segments_completed: job.segments_completed,
                    segments_total: job.segments_total,
                });
                Ok(false)
            }
            CompletionOutcome::ReadyForComposition(job) => {
                self.bus.publish(RenderEventKind::JobProgress {
                    job_id,
                    segments_completed: job.segments_completed,
                    segments_total: job.segments_total,
                });
                self.dispatch_composition(&job).await?;
                Ok(true)
            }
        }
    }

    /// Flip every outstanding entry of `job_id` that already has a recorded
    /// generation.
    async fn settle_recorded(&self, job_id: DbId) -> OrchestratorResult<()> {
        let job = self.store.get_render_job(job_id).await?;
        for entry in job.segments.iter().filter(|s| !s.completed) {
            if self
                .store
                .find_generation(entry.segment_id, &entry.fingerprint)
                .await?
                .is_some()
            {
                self.record_completion(job_id, entry.segment_id, &entry.fingerprint)
                    .await?;
            }
        }
        Ok(())
    }

    /// Returns whether this call failed the job.
    async fn fail_job(&self, job_id: DbId, code: ErrorCode, message: &str) -> OrchestratorResult<bool> {
        match self.store.fail_job(job_id, Some(code), message).await? {
            Some(_) => {
                tracing::warn!(job_id, %code, reason = message, "Render job failed");
                self.bus.publish(RenderEventKind::JobFailed {
                    job_id,
                    code: Some(code),
                    message: message.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cancel_external(&self, segment: &Segment) {
        let (Some(backend), Some(external_job_id)) =
            (segment.backend.clone(), segment.external_job_id.clone())
        else {
            return;
        };
        let adapter = match self.adapters.resolve(&backend) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(segment_id = segment.id, %backend, error = %e, "Cannot cancel external job");
                return;
            }
        };
        let segment_id = segment.id;
        tokio::spawn(async move {
            match adapter.cancel(&external_job_id).await {
                Ok(()) => tracing::info!(segment_id, %backend, %external_job_id, "External job cancelled"),
                Err(e) => tracing::warn!(
                    segment_id,
                    %backend,
                    %external_job_id,
                    error = %e,
                    "Best-effort external cancel failed"
                ),
            }
        });
    }
}

fn snapshot_entry(segment: &Segment, completed: bool) -> JobSegment {
    JobSegment {
        segment_id: segment.id,
        order_index: segment.order_index,
        fingerprint: segment.fingerprint.clone(),
        completed,
    }
}
